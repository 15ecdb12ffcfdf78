//! Rewriting rules evaluated by membranes

use arbor_core::{KernelError, KernelResult, Multiset, ObjectType};

/// Structural effect of a rule beyond rewriting the stock
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StructuralAction {
    #[default]
    None,
    /// Membrane stops evolving after this rule fires
    Dissolve,
    /// Membrane splits its stock between two new children
    Divide,
    /// Products go to the first active child
    SendIn,
    /// Products go to the parent
    SendOut,
}

impl StructuralAction {
    pub fn name(self) -> &'static str {
        match self {
            StructuralAction::None => "none",
            StructuralAction::Dissolve => "dissolve",
            StructuralAction::Divide => "divide",
            StructuralAction::SendIn => "send-in",
            StructuralAction::SendOut => "send-out",
        }
    }

    /// Products leave the membrane instead of joining its stock
    pub fn transports(self) -> bool {
        matches!(self, StructuralAction::SendIn | StructuralAction::SendOut)
    }
}

/// Multiset rewriting rule: consume `lhs`, produce `rhs`, then apply `action`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    /// Higher values are evaluated first
    pub priority: u32,
    pub lhs: Multiset,
    pub rhs: Multiset,
    pub action: StructuralAction,
}

impl Rule {
    pub fn new(priority: u32) -> Self {
        Rule {
            priority,
            lhs: Multiset::new(),
            rhs: Multiset::new(),
            action: StructuralAction::None,
        }
    }

    pub fn rewrite(priority: u32, lhs: Multiset, rhs: Multiset) -> Self {
        Rule {
            priority,
            lhs,
            rhs,
            action: StructuralAction::None,
        }
    }

    pub fn consumes(mut self, object: ObjectType, count: u64) -> Self {
        self.lhs.add(object, count);
        self
    }

    pub fn produces(mut self, object: ObjectType, count: u64) -> Self {
        self.rhs.add(object, count);
        self
    }

    pub fn then(mut self, action: StructuralAction) -> Self {
        self.action = action;
        self
    }

    /// Reject rules that could never do anything
    pub fn validate(&self) -> KernelResult<()> {
        if self.lhs.is_empty() && self.rhs.is_empty() && self.action == StructuralAction::None {
            return Err(KernelError::invalid("rule has no reactants, products or action"));
        }
        if self.action.transports() && self.rhs.is_empty() {
            return Err(KernelError::invalid(format!(
                "{} rule has nothing to send",
                self.action.name()
            )));
        }
        Ok(())
    }
}
