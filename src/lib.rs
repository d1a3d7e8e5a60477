pub mod config;
pub mod dashboard;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{Result, TitanError};
