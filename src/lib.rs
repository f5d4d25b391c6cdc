pub mod covariance;
pub mod error;
pub mod leakage_model;
pub mod linalg;
pub mod probability;
pub mod rank;
pub mod selection;
pub mod template;
pub mod trace;
pub mod util;

pub use error::Error;
