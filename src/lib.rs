pub mod bus;
pub mod config;
pub mod coreapi;
pub mod dispatcher;
pub mod domain;
pub mod learner;
pub mod models;
pub mod planner;
pub mod rtl;
pub mod solver;
pub mod telemetry;
pub mod tsdb;
