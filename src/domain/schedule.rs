use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DeviceKind, Horizon, TimeSeries};

/// What kind of control signal a series carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    PowerW,
    SetpointC,
}

/// The planned control trajectory for one device, plus the planned internal
/// state used for result reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSeries {
    pub entity_id: String,
    pub kind: DeviceKind,
    pub signal: ControlSignal,
    pub control: TimeSeries,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<TimeSeries>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soc_wh: Option<TimeSeries>,
}

/// The full output of one planning cycle.
///
/// Deliberately carries no creation timestamp or random id: two cycles over
/// identical inputs must produce byte-identical schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSchedule {
    pub priority: u32,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub interval_s: i64,
    pub series: Vec<ControlSeries>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleValidationError {
    #[error("schedule window is invalid: start must be before stop")]
    InvalidWindow,
    #[error("series for {entity_id} has a non-finite value at {at}")]
    NonFiniteValue { entity_id: String, at: DateTime<Utc> },
    #[error("series for {entity_id} has timestamp {at} off the horizon grid")]
    OffGrid { entity_id: String, at: DateTime<Utc> },
}

impl DispatchSchedule {
    pub fn new(horizon: &Horizon, priority: u32, series: Vec<ControlSeries>) -> Self {
        Self {
            priority,
            start: horizon.start(),
            stop: horizon.stop(),
            interval_s: horizon.interval().num_seconds(),
            series,
        }
    }

    /// Check every series lies on the horizon grid with finite values.
    pub fn validate(&self) -> Result<(), ScheduleValidationError> {
        if self.start >= self.stop {
            return Err(ScheduleValidationError::InvalidWindow);
        }
        for series in &self.series {
            for (&at, &value) in series.control.iter() {
                if !value.is_finite() {
                    return Err(ScheduleValidationError::NonFiniteValue {
                        entity_id: series.entity_id.clone(),
                        at,
                    });
                }
                let offset = (at - self.start).num_seconds();
                if at < self.start
                    || at >= self.stop
                    || self.interval_s == 0
                    || offset % self.interval_s != 0
                {
                    return Err(ScheduleValidationError::OffGrid {
                        entity_id: series.entity_id.clone(),
                        at,
                    });
                }
            }
        }
        Ok(())
    }

    /// Total commanded controllable power at step start `at`, in kW.
    /// Setpoint series do not contribute.
    pub fn commanded_power_kw(&self, at: DateTime<Utc>) -> f64 {
        self.series
            .iter()
            .filter(|s| s.signal == ControlSignal::PowerW)
            .filter_map(|s| s.control.value_at(at))
            .sum::<f64>()
            / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Horizon;
    use chrono::{Duration, TimeZone};

    fn horizon() -> Horizon {
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        Horizon::new(start, start + Duration::hours(2), Duration::minutes(30)).unwrap()
    }

    fn power_series(horizon: &Horizon, watts: f64) -> ControlSeries {
        ControlSeries {
            entity_id: "bat-1".to_string(),
            kind: DeviceKind::ElectricStorage,
            signal: ControlSignal::PowerW,
            control: crate::domain::series::from_steps(horizon, &vec![watts; horizon.steps()]),
            temperature_c: None,
            soc_wh: None,
        }
    }

    #[test]
    fn validate_accepts_grid_aligned_series() {
        let horizon = horizon();
        let schedule = DispatchSchedule::new(&horizon, 10, vec![power_series(&horizon, 1500.0)]);
        assert_eq!(schedule.validate(), Ok(()));
        assert_eq!(schedule.interval_s, 1800);
    }

    #[test]
    fn validate_rejects_off_grid_timestamp() {
        let horizon = horizon();
        let mut series = power_series(&horizon, 1000.0);
        series.control.insert(horizon.start() + Duration::minutes(7), 500.0);
        let schedule = DispatchSchedule::new(&horizon, 10, vec![series]);
        assert!(matches!(
            schedule.validate(),
            Err(ScheduleValidationError::OffGrid { .. })
        ));
    }

    #[test]
    fn validate_rejects_non_finite_value() {
        let horizon = horizon();
        let mut series = power_series(&horizon, 1000.0);
        series.control.insert(horizon.start(), f64::NAN);
        let schedule = DispatchSchedule::new(&horizon, 10, vec![series]);
        assert!(matches!(
            schedule.validate(),
            Err(ScheduleValidationError::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn commanded_power_sums_power_series_only() {
        let horizon = horizon();
        let mut setpoints = power_series(&horizon, 0.0);
        setpoints.signal = ControlSignal::SetpointC;
        let schedule = DispatchSchedule::new(
            &horizon,
            10,
            vec![power_series(&horizon, 2000.0), setpoints],
        );
        assert!((schedule.commanded_power_kw(horizon.start()) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn identical_inputs_serialize_identically() {
        let horizon = horizon();
        let a = DispatchSchedule::new(&horizon, 10, vec![power_series(&horizon, 1500.0)]);
        let b = DispatchSchedule::new(&horizon, 10, vec![power_series(&horizon, 1500.0)]);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
