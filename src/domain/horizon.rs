use chrono::{DateTime, Duration, Utc};

use super::ControlError;

/// The discrete time grid the planner optimizes over.
///
/// `interval` must divide `stop - start` exactly; every time-indexed planner
/// input is sampled to one value per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon {
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    interval: Duration,
}

impl Horizon {
    pub fn new(
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        interval: Duration,
    ) -> Result<Self, ControlError> {
        if stop <= start {
            return Err(ControlError::HorizonInvalid(format!(
                "stop {stop} must be after start {start}"
            )));
        }
        if interval <= Duration::zero() {
            return Err(ControlError::HorizonInvalid(format!(
                "interval must be positive, got {interval}"
            )));
        }
        let span = stop - start;
        let span_s = span.num_seconds();
        let interval_s = interval.num_seconds();
        if interval_s == 0 || span_s % interval_s != 0 {
            return Err(ControlError::HorizonInvalid(format!(
                "interval {interval_s}s does not divide the range of {span_s}s"
            )));
        }
        Ok(Self { start, stop, interval })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn stop(&self) -> DateTime<Utc> {
        self.stop
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of steps `N`.
    pub fn steps(&self) -> usize {
        ((self.stop - self.start).num_seconds() / self.interval.num_seconds()) as usize
    }

    /// Step duration in hours.
    pub fn dt_hours(&self) -> f64 {
        self.interval.num_seconds() as f64 / 3600.0
    }

    /// Start timestamp of step `k`.
    pub fn step_start(&self, k: usize) -> DateTime<Utc> {
        self.start + self.interval * k as i32
    }

    /// Start timestamps of all `N` steps.
    pub fn step_times(&self) -> Vec<DateTime<Utc>> {
        (0..self.steps()).map(|k| self.step_start(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap()
    }

    #[test]
    fn divides_exactly() {
        let horizon = Horizon::new(t0(), t0() + Duration::hours(6), Duration::minutes(10)).unwrap();
        assert_eq!(horizon.steps(), 36);
        assert!((horizon.dt_hours() - 1.0 / 6.0).abs() < 1e-12);
        assert_eq!(horizon.step_start(6), t0() + Duration::hours(1));
    }

    #[rstest::rstest]
    #[case::nondividing_interval(Duration::minutes(25), Duration::minutes(10))]
    #[case::reversed_range(Duration::hours(-1), Duration::minutes(10))]
    #[case::zero_interval(Duration::hours(1), Duration::zero())]
    #[case::negative_interval(Duration::hours(1), Duration::minutes(-10))]
    #[case::empty_range(Duration::zero(), Duration::minutes(10))]
    fn rejects_invalid_horizons(#[case] span: Duration, #[case] interval: Duration) {
        let err = Horizon::new(t0(), t0() + span, interval);
        assert!(matches!(err, Err(ControlError::HorizonInvalid(_))));
    }

    #[test]
    fn single_step_horizon() {
        let horizon =
            Horizon::new(t0(), t0() + Duration::minutes(10), Duration::minutes(10)).unwrap();
        assert_eq!(horizon.steps(), 1);
        assert_eq!(horizon.step_times(), vec![t0()]);
    }
}
