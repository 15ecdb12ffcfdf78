//! Topology table
//!
//! Fan-out at every depth of the loop and membrane trees is bounded by the
//! number of unlabeled rooted trees with `n` nodes (OEIS A000081). The same
//! table sizes the bootstrap tiers, so there is exactly one source of truth
//! for how wide the hierarchy may grow.

/// A000081 prefix for depths 0..=16
pub const ROOTED_TREES: [u32; 17] = [
    0, 1, 1, 2, 4, 9, 20, 48, 115, 286, 719, 1842, 4766, 12486, 32973, 87811, 235381,
];

/// Deepest tier the canonical hierarchy is built to
pub const CANONICAL_MAX_DEPTH: u32 = 8;

/// Branching bound for `depth` in the canonical table, 0 past its end
#[inline]
pub fn max_children(depth: u32) -> u32 {
    ROOTED_TREES.get(depth as usize).copied().unwrap_or(0)
}

/// Depth-indexed fan-out bounds, read-only once built
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    table: Vec<u32>,
    max_depth: u32,
}

impl Topology {
    /// The canonical table, built to depth 8
    pub fn canonical() -> Self {
        Topology {
            table: ROOTED_TREES.to_vec(),
            max_depth: CANONICAL_MAX_DEPTH,
        }
    }

    /// A custom table; the deepest depth is its last index
    pub fn from_table(table: &[u32]) -> Self {
        Topology {
            table: table.to_vec(),
            max_depth: table.len().saturating_sub(1) as u32,
        }
    }

    /// Same table, different depth limit
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[inline]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Number of children a node may hold at `depth`, 0 past the table
    #[inline]
    pub fn max_children(&self, depth: u32) -> u32 {
        self.table.get(depth as usize).copied().unwrap_or(0)
    }

    /// Whether `depth` may hold nodes at all
    #[inline]
    pub fn admits_depth(&self, depth: u32) -> bool {
        depth <= self.max_depth
    }

    /// Nodes a full `spawn_children` from a root at depth 0 would create,
    /// root included
    pub fn full_tree_size(&self) -> u64 {
        let mut total = 1u64;
        let mut width = 1u64;
        for depth in 1..=self.max_depth {
            width = width.saturating_mul(self.max_children(depth) as u64);
            if width == 0 {
                break;
            }
            total = total.saturating_add(width);
        }
        total
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::canonical()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_values() {
        assert_eq!(max_children(0), 0);
        assert_eq!(max_children(3), 2);
        assert_eq!(max_children(5), 9);
        assert_eq!(max_children(7), 48);
        assert_eq!(max_children(16), 235381);
        assert_eq!(max_children(17), 0);
        assert_eq!(max_children(u32::MAX), 0);
    }

    #[test]
    fn test_custom_table() {
        let topo = Topology::from_table(&[0, 1, 1, 2]);
        assert_eq!(topo.max_depth(), 3);
        assert_eq!(topo.max_children(3), 2);
        assert_eq!(topo.max_children(4), 0);
        assert!(topo.admits_depth(3));
        assert!(!topo.admits_depth(4));
    }

    #[test]
    fn test_full_tree_size() {
        // 1 root + 1 + 1 + 2
        assert_eq!(Topology::from_table(&[0, 1, 1, 2]).full_tree_size(), 5);
        assert_eq!(Topology::from_table(&[0]).full_tree_size(), 1);
    }

    #[test]
    fn test_canonical_depth_limit() {
        let topo = Topology::canonical();
        assert_eq!(topo.max_depth(), CANONICAL_MAX_DEPTH);
        assert_eq!(topo.max_children(9), 286);
        assert!(!topo.admits_depth(9));
    }
}
