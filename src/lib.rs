pub mod clock;
pub mod config;
pub mod engine;
pub mod estimator;
pub mod geo;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod wal;
