//! The warden controller: config loading, the log bridge and the operator
//! console around a `warden_core::Manager`.

pub mod bridge;
pub mod config;
pub mod console;

pub use bridge::{BridgeSettings, LogBridge};
pub use config::ControlConfig;
pub use console::{Command, Console};
