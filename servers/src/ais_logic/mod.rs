pub mod batch_sync;
pub mod config;
pub mod dispatcher;
pub mod downstream;
pub mod logger;
pub mod model;
pub mod monitor;
pub mod upstream;
