pub mod config;
pub mod logging;
pub mod ota;
pub mod upload;
