//! Device model library.
//!
//! Every controllable device class contributes the same four things to a
//! planning problem: objective terms, constraints, a per-step dispatch
//! expression (its grid draw, in kW), and a critical action for the RTL.
//! The planner composes the enabled sub-models into one problem; after the
//! solve, each built model interprets its primal values back into control
//! series.

pub mod ev;
pub mod space_heating;
pub mod storage;
pub mod water_heater;

use crate::domain::{ControlError, ControlSeries, Device, DeviceSpec, Horizon};
use crate::solver::{LinExpr, ProblemBuilder, Solution};

pub use ev::{EvInputs, EvModel};
pub use space_heating::{SpaceHeatingInputs, SpaceHeatingModel};
pub use storage::{StorageInputs, StorageModel};
pub use water_heater::{WaterHeaterInputs, WaterHeaterModel};

/// A device sub-model ready to contribute to a planning problem.
pub trait SubModel: Send + Sync {
    fn device(&self) -> &Device;

    /// Add this device's variables, constraints, and objective terms to the
    /// problem. Returns the handle used for interpretation.
    fn build(
        &self,
        pb: &mut ProblemBuilder,
        horizon: &Horizon,
    ) -> Result<Box<dyn BuiltSubModel>, ControlError>;
}

/// The solver-side footprint of one built sub-model.
pub trait BuiltSubModel: Send + Sync {
    /// Grid draw per step, in kW (positive = draw).
    fn dispatch_kw(&self) -> &[LinExpr];

    /// Read the primal values back into control (and state) series.
    fn interpret(&self, solution: &Solution, horizon: &Horizon) -> Vec<ControlSeries>;
}

/// Per-kind planner inputs, assembled from Core API preferences and state.
pub enum ModelInputs {
    SpaceHeating(SpaceHeatingInputs),
    WaterHeater(WaterHeaterInputs),
    Storage(StorageInputs),
    Ev(EvInputs),
}

/// Registry: device kind → sub-model constructor.
pub fn submodel_for(
    device: &Device,
    inputs: ModelInputs,
) -> Result<Box<dyn SubModel>, ControlError> {
    match (&device.spec, inputs) {
        (DeviceSpec::WaterHeater(params), ModelInputs::WaterHeater(inputs)) => Ok(Box::new(
            WaterHeaterModel::new(device.clone(), params.clone(), inputs),
        )),
        (DeviceSpec::ElectricStorage(params), ModelInputs::Storage(inputs)) => Ok(Box::new(
            StorageModel::new(device.clone(), params.clone(), inputs),
        )),
        (DeviceSpec::ElectricVehicleV1g(params), ModelInputs::Ev(inputs)) => {
            Ok(Box::new(EvModel::new(device.clone(), params.clone(), inputs)))
        }
        (DeviceSpec::SpaceHeating(params), ModelInputs::SpaceHeating(inputs)) => Ok(Box::new(
            SpaceHeatingModel::new(device.clone(), params.clone(), inputs)?,
        )),
        (spec, _) => Err(ControlError::ConfigInvalid(format!(
            "inputs do not match device kind for {:?}",
            std::mem::discriminant(spec)
        ))),
    }
}

/// Comfort weighting derived from the device priority; floored so that a
/// zero-priority device still has a (weak) comfort pull.
pub(crate) fn priority_weight(device: &Device) -> f64 {
    (device.priority as f64).max(1.0)
}

/// Expect an input vector of exactly one value per horizon step.
pub(crate) fn check_step_len(
    what: &str,
    values: &[f64],
    horizon: &Horizon,
) -> Result<(), ControlError> {
    if values.len() != horizon.steps() {
        return Err(ControlError::DataUnavailable(format!(
            "{what}: expected {} samples, got {}",
            horizon.steps(),
            values.len()
        )));
    }
    Ok(())
}
