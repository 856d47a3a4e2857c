//! Coalescing Controller
//!
//! Adaptive interrupt batching. Each tick samples aggregate pending work:
//! above the high-water mark the interval halves, below the low-water mark
//! it doubles, in between it holds. The interval never leaves
//! `[min_usecs, max_usecs]`.

use crate::config::CoalesceConfig;
use arc_swap::ArcSwap;
use mqnic_common::NicResult;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Direction of one adaptation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceAction {
    /// Load high: shorter batching window
    Halved,
    /// Load low: longer batching window
    Doubled,
    /// Between the marks, at a bound, or adaptation off
    Held,
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceDecision {
    /// Interval before the tick (microseconds)
    pub previous: u32,
    /// Interval after the tick (microseconds)
    pub current: u32,
    /// Step taken
    pub action: CoalesceAction,
}

impl CoalesceDecision {
    /// Did the interval change
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Device-wide coalescing interval
pub struct CoalescingController {
    interval: AtomicU32,
    config: ArcSwap<CoalesceConfig>,
}

impl CoalescingController {
    /// Start at `initial_usecs`, clamped to the bounds. Fails with
    /// `InvalidConfig` if the bounds are empty.
    pub fn new(config: CoalesceConfig) -> NicResult<Self> {
        config.validate()?;
        let initial = config.initial_usecs.clamp(config.min_usecs, config.max_usecs);
        Ok(Self {
            interval: AtomicU32::new(initial),
            config: ArcSwap::from_pointee(config),
        })
    }

    /// Current interval (microseconds)
    #[inline]
    pub fn interval(&self) -> u32 {
        self.interval.load(Ordering::Acquire)
    }

    /// Set the interval, clamped to bounds; returns the applied value.
    pub fn set_interval(&self, usecs: u32) -> u32 {
        let config = self.config.load();
        let applied = usecs.clamp(config.min_usecs, config.max_usecs);
        self.interval.store(applied, Ordering::Release);
        applied
    }

    /// Swap settings; the current interval is clamped into the new bounds.
    /// Invalid settings are rejected and the old ones stay.
    pub fn set_config(&self, config: CoalesceConfig) -> NicResult<u32> {
        config.validate()?;
        let (min, max) = (config.min_usecs, config.max_usecs);
        self.config.store(Arc::new(config));
        let clamped = self.interval().clamp(min, max);
        self.interval.store(clamped, Ordering::Release);
        Ok(clamped)
    }

    /// One adaptation step for `aggregate_pending`
    pub fn tick(&self, aggregate_pending: u64) -> CoalesceDecision {
        let config = self.config.load();
        let step = |cur: u32| -> Option<u32> {
            if !config.adaptive {
                return None;
            }
            let next = if aggregate_pending > config.high_water {
                (cur / 2).max(config.min_usecs)
            } else if aggregate_pending < config.low_water {
                cur.saturating_mul(2).min(config.max_usecs)
            } else {
                cur
            };
            (next != cur).then_some(next)
        };

        let decision = match self
            .interval
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, step)
        {
            Ok(previous) => {
                let current = step(previous).unwrap_or(previous);
                let action = if current < previous {
                    CoalesceAction::Halved
                } else {
                    CoalesceAction::Doubled
                };
                CoalesceDecision {
                    previous,
                    current,
                    action,
                }
            }
            Err(current) => CoalesceDecision {
                previous: current,
                current,
                action: CoalesceAction::Held,
            },
        };

        if decision.changed() {
            debug!(
                pending = aggregate_pending,
                from = decision.previous,
                to = decision.current,
                "Coalescing adjusted"
            );
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqnic_common::NicError;

    #[test]
    fn test_high_load_halves() {
        let c = CoalescingController::new(CoalesceConfig::default()).unwrap();
        assert_eq!(c.interval(), 64);

        let d = c.tick(1500);
        assert_eq!(d.previous, 64);
        assert_eq!(d.current, 32);
        assert_eq!(d.action, CoalesceAction::Halved);
    }

    #[test]
    fn test_floor_and_ceiling() {
        let c = CoalescingController::new(CoalesceConfig::default()).unwrap();
        for _ in 0..10 {
            c.tick(5000);
        }
        assert_eq!(c.interval(), 8);
        assert_eq!(c.tick(5000).action, CoalesceAction::Held);

        for _ in 0..10 {
            c.tick(0);
        }
        assert_eq!(c.interval(), 128);
    }

    #[test]
    fn test_hysteresis_band_holds() {
        let c = CoalescingController::new(CoalesceConfig::default()).unwrap();
        for pending in [100, 500, 1000] {
            let d = c.tick(pending);
            assert!(!d.changed());
        }
        assert_eq!(c.interval(), 64);
    }

    #[test]
    fn test_non_adaptive() {
        let c = CoalescingController::new(CoalesceConfig {
            adaptive: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(c.tick(10_000).action, CoalesceAction::Held);
        assert_eq!(c.interval(), 64);
    }

    #[test]
    fn test_set_interval_clamps() {
        let c = CoalescingController::new(CoalesceConfig::default()).unwrap();
        assert_eq!(c.set_interval(1), 8);
        assert_eq!(c.set_interval(1000), 128);

        let applied = c
            .set_config(CoalesceConfig {
                max_usecs: 100,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(applied, 100);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let inverted = CoalesceConfig {
            min_usecs: 256,
            max_usecs: 16,
            ..Default::default()
        };
        assert!(matches!(
            CoalescingController::new(inverted.clone()),
            Err(NicError::InvalidConfig(_))
        ));

        let c = CoalescingController::new(CoalesceConfig::default()).unwrap();
        assert!(matches!(c.set_config(inverted), Err(NicError::InvalidConfig(_))));
        assert_eq!(c.set_interval(1000), 128);
        assert_eq!(c.interval(), 128);
    }
}
