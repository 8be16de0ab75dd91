pub mod check_points;
pub mod config;
pub mod data;
pub mod export;
pub mod model;
pub mod mtp;
pub mod schedule;
pub mod train;
pub mod utils;

pub use config::TrainConfig;
pub use train::Trainer;
