//! Early stopping on the dev compound metric

use serde::{Deserialize, Serialize};

/// What the training loop does after an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopDecision {
    /// Keep training
    Continue,
    /// Break out of the epoch loop
    Stop,
}

/// Stops on the first epoch whose dev MLAS + BLEX falls below the best so far
///
/// There is no patience window: a single regression ends the revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EarlyStopping {
    best: f64,
}

impl EarlyStopping {
    /// Fresh tracker with a best value of zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Compound metric for a dev evaluation
    pub fn compound(mlas: f64, blex: f64) -> f64 {
        mlas + blex
    }

    /// Best value seen so far
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Record one epoch's value; the best value is left untouched on `Stop`
    pub fn observe(&mut self, value: f64) -> StopDecision {
        if value < self.best {
            StopDecision::Stop
        } else {
            self.best = value;
            StopDecision::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_stops_on_first_regression() {
        let mut stopping = EarlyStopping::new();
        assert_eq!(stopping.observe(0.5), StopDecision::Continue);
        assert_eq!(stopping.observe(0.7), StopDecision::Continue);
        // ties do not stop
        assert_eq!(stopping.observe(0.7), StopDecision::Continue);
        assert_eq!(stopping.observe(0.69), StopDecision::Stop);
        assert_eq!(stopping.best(), 0.7);
    }

    proptest! {
        #[test]
        fn prop_halts_at_first_strict_drop(values in proptest::collection::vec(0.0f64..2.0, 1..20)) {
            let mut stopping = EarlyStopping::new();
            let mut running_best = 0.0f64;
            for value in values {
                let before = stopping.best();
                let decision = stopping.observe(value);
                if value < running_best {
                    prop_assert_eq!(decision, StopDecision::Stop);
                    prop_assert_eq!(stopping.best(), before);
                    break;
                }
                prop_assert_eq!(decision, StopDecision::Continue);
                prop_assert!(stopping.best() >= before);
                running_best = value;
            }
        }
    }
}
