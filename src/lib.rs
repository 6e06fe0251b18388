//! `bt-mqtt-scanner` library.
//!
//! The binary (`src/main.rs`) handles the CLI, logging setup, signals and
//! exit codes. Everything between the Bluetooth receiver and the MQTT broker
//! lives here, with the receiver behind [`scanner::Receiver`] so the whole
//! path can be driven by a fake in tests.

pub mod ble;
pub mod config;
pub mod filter;
pub mod manager;
pub mod messages;
pub mod mqtt;
pub mod normalize;
pub mod pipeline;
pub mod scanner;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::AppConfig;
pub use manager::Manager;
pub use messages::{Advertisement, StatusReport};
pub use scanner::{CaptureError, Receiver};
