pub mod device;
pub mod error;
pub mod horizon;
pub mod schedule;
pub mod series;
pub mod thermal;

pub use device::{
    CriticalAction, Device, DeviceKind, DeviceSpec, EvParams, SpaceHeatingParams, StorageParams,
    WaterHeaterParams,
};
pub use error::ControlError;
pub use horizon::Horizon;
pub use schedule::{ControlSeries, ControlSignal, DispatchSchedule};
pub use series::TimeSeries;
pub use thermal::ThermalModel;
