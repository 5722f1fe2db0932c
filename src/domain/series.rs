use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ControlError, Horizon};

/// An ordered timestamp → value mapping.
///
/// Profiles arriving over the bus or from the Core API are piecewise
/// constant: a value holds from its timestamp until the next one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSeries(BTreeMap<DateTime<Utc>, f64>);

impl TimeSeries {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, at: DateTime<Utc>, value: f64) {
        self.0.insert(at, value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DateTime<Utc>, &f64)> {
        self.0.iter()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.0.keys().next().copied()
    }

    /// Latest value at or before `at` (piecewise-constant lookup).
    pub fn value_at(&self, at: DateTime<Utc>) -> Option<f64> {
        self.0.range(..=at).next_back().map(|(_, v)| *v)
    }

    /// Sample the series onto the horizon grid, one value per step start,
    /// carrying the last observation forward. Fails when no observation
    /// exists at or before the first step.
    pub fn sample_on(&self, horizon: &Horizon) -> Result<Vec<f64>, ControlError> {
        let mut out = Vec::with_capacity(horizon.steps());
        for at in horizon.step_times() {
            match self.value_at(at) {
                Some(value) => out.push(value),
                None => {
                    return Err(ControlError::DataUnavailable(format!(
                        "series has no value at or before {at}"
                    )))
                }
            }
        }
        Ok(out)
    }
}

impl FromIterator<(DateTime<Utc>, f64)> for TimeSeries {
    fn from_iter<I: IntoIterator<Item = (DateTime<Utc>, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Build a series from step values aligned to a horizon grid.
pub fn from_steps(horizon: &Horizon, values: &[f64]) -> TimeSeries {
    horizon
        .step_times()
        .into_iter()
        .zip(values.iter().copied())
        .collect()
}
