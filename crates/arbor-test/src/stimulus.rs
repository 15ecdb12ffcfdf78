//! Seeded stimulus generation
//!
//! Produces the external events a running hierarchy sees: object parcels,
//! evolve ticks, broadcasts, point-to-point messages and timer expiries.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use arbor_core::ObjectType;

/// Object types the harness rule set understands
pub const REACTANT: ObjectType = ObjectType(1);
pub const PRODUCT: ObjectType = ObjectType(2);
pub const CARGO: ObjectType = ObjectType(3);

/// One external stimulus; membrane indices refer to the harness order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stimulus {
    /// Parcel of objects addressed to one membrane
    Seed {
        target: usize,
        object: ObjectType,
        count: u64,
    },
    Tick { target: usize },
    /// Payload-free propagate from the root
    Broadcast,
    Message { from: usize, to: usize, len: usize },
    Timer { target: usize },
}

/// Relative weights of each stimulus kind
#[derive(Clone, Debug)]
pub struct StimulusConfig {
    pub seed_weight: u32,
    pub tick_weight: u32,
    pub broadcast_weight: u32,
    pub message_weight: u32,
    pub timer_weight: u32,
    /// Largest parcel a single seed carries
    pub max_seed: u64,
    /// Longest message body
    pub max_message: usize,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        StimulusConfig {
            seed_weight: 4,
            tick_weight: 6,
            broadcast_weight: 1,
            message_weight: 2,
            timer_weight: 1,
            max_seed: 8,
            max_message: 64,
        }
    }
}

impl StimulusConfig {
    /// Mostly ticks, few parcels
    pub fn quiet() -> Self {
        StimulusConfig {
            seed_weight: 1,
            tick_weight: 8,
            broadcast_weight: 0,
            message_weight: 1,
            timer_weight: 0,
            max_seed: 4,
            max_message: 16,
        }
    }

    /// Heavy traffic of every kind
    pub fn noisy() -> Self {
        StimulusConfig {
            seed_weight: 5,
            tick_weight: 5,
            broadcast_weight: 3,
            message_weight: 4,
            timer_weight: 3,
            max_seed: 32,
            max_message: 512,
        }
    }

    fn weights(&self) -> [u32; 5] {
        [
            self.seed_weight,
            self.tick_weight,
            self.broadcast_weight,
            self.message_weight,
            self.timer_weight,
        ]
    }
}

/// Reproducible stimulus source
pub struct StimulusGenerator {
    config: StimulusConfig,
    kinds: Option<WeightedIndex<u32>>,
    rng: StdRng,
}

impl StimulusGenerator {
    pub fn new(config: StimulusConfig, seed: u64) -> Self {
        // All-zero weights yield ticks only
        let kinds = WeightedIndex::new(config.weights()).ok();
        StimulusGenerator {
            config,
            kinds,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next stimulus for a hierarchy of `membranes` members
    pub fn next(&mut self, membranes: usize) -> Stimulus {
        let membranes = membranes.max(1);
        let kind = match &self.kinds {
            Some(kinds) => kinds.sample(&mut self.rng),
            None => 1,
        };
        let target = self.rng.gen_range(0..membranes);

        match kind {
            0 => {
                let object = match self.rng.gen_range(0..3) {
                    0 => REACTANT,
                    1 => PRODUCT,
                    _ => CARGO,
                };
                Stimulus::Seed {
                    target,
                    object,
                    count: self.rng.gen_range(1..=self.config.max_seed.max(1)),
                }
            }
            2 => Stimulus::Broadcast,
            3 => Stimulus::Message {
                from: target,
                to: self.rng.gen_range(0..membranes),
                len: self.rng.gen_range(1..=self.config.max_message.max(1)),
            },
            4 => Stimulus::Timer { target },
            _ => Stimulus::Tick { target },
        }
    }

    pub fn batch(&mut self, membranes: usize, count: usize) -> Vec<Stimulus> {
        (0..count).map(|_| self.next(membranes)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = StimulusGenerator::new(StimulusConfig::default(), 7);
        let mut b = StimulusGenerator::new(StimulusConfig::default(), 7);
        assert_eq!(a.batch(10, 100), b.batch(10, 100));
    }

    #[test]
    fn test_targets_in_range() {
        let mut generator = StimulusGenerator::new(StimulusConfig::noisy(), 3);
        for stimulus in generator.batch(5, 500) {
            match stimulus {
                Stimulus::Seed { target, count, .. } => {
                    assert!(target < 5);
                    assert!((1..=32).contains(&count));
                }
                Stimulus::Tick { target } | Stimulus::Timer { target } => assert!(target < 5),
                Stimulus::Message { from, to, len } => {
                    assert!(from < 5 && to < 5);
                    assert!((1..=512).contains(&len));
                }
                Stimulus::Broadcast => {}
            }
        }
    }

    #[test]
    fn test_zero_weights_only_tick() {
        let config = StimulusConfig {
            seed_weight: 0,
            tick_weight: 0,
            broadcast_weight: 0,
            message_weight: 0,
            timer_weight: 0,
            ..Default::default()
        };
        let mut generator = StimulusGenerator::new(config, 1);
        assert!(generator
            .batch(3, 50)
            .iter()
            .all(|s| matches!(s, Stimulus::Tick { .. })));
    }
}
