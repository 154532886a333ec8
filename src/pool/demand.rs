use crate::core::SessionKind;

/// Rolling estimate of the share of acquires that ask for a write session.
///
/// An exponentially weighted moving average with `alpha = 1 / window`.
/// Every observation moves the estimate toward the observed kind, so a
/// workload that shifts from all-write to all-read converges monotonically.
#[derive(Debug, Clone)]
pub(crate) struct DemandTracker {
    write_fraction: f64,
    alpha: f64,
    observed: [u64; 2],
}

impl DemandTracker {
    pub fn new(initial_write_fraction: f64, window: usize) -> Self {
        Self {
            write_fraction: initial_write_fraction.clamp(0.0, 1.0),
            alpha: 1.0 / window.max(1) as f64,
            observed: [0, 0],
        }
    }

    pub fn record(&mut self, kind: SessionKind) {
        let sample = match kind {
            SessionKind::ReadOnly => 0.0,
            SessionKind::ReadWritePrepared => 1.0,
        };
        self.write_fraction += self.alpha * (sample - self.write_fraction);
        self.observed[kind.index()] += 1;
    }

    pub fn write_fraction(&self) -> f64 {
        self.write_fraction
    }

    /// How many of `total` sessions should be ReadWritePrepared
    pub fn write_target(&self, total: usize) -> usize {
        ((total as f64) * self.write_fraction).round() as usize
    }

    pub fn observed(&self, kind: SessionKind) -> u64 {
        self.observed[kind.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_fraction_is_clamped() {
        assert_eq!(DemandTracker::new(2.0, 10).write_fraction(), 1.0);
        assert_eq!(DemandTracker::new(-1.0, 10).write_fraction(), 0.0);
    }

    #[test]
    fn test_converges_from_all_write_to_all_read() {
        let mut demand = DemandTracker::new(0.0, 20);

        let mut previous = demand.write_fraction();
        for _ in 0..200 {
            demand.record(SessionKind::ReadWritePrepared);
            assert!(demand.write_fraction() >= previous);
            previous = demand.write_fraction();
        }
        assert!(demand.write_fraction() > 0.99);

        for _ in 0..200 {
            demand.record(SessionKind::ReadOnly);
            assert!(demand.write_fraction() <= previous);
            previous = demand.write_fraction();
        }
        assert!(demand.write_fraction() < 0.01);

        assert_eq!(demand.observed(SessionKind::ReadOnly), 200);
        assert_eq!(demand.observed(SessionKind::ReadWritePrepared), 200);
    }

    #[test]
    fn test_write_target_rounds() {
        let demand = DemandTracker::new(0.25, 100);
        assert_eq!(demand.write_target(10), 3);
        assert_eq!(demand.write_target(0), 0);
        assert_eq!(demand.write_target(4), 1);
    }
}
