pub mod config;
pub mod error;

pub use config::CloudioConfig;
pub use error::{CloudioError, CloudioResult};
