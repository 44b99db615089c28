pub mod agent;
pub mod config;
pub mod dispatch;
pub mod server;

pub use agent::Agent;
pub use config::{AgentConfig, ListenAddr};
pub use dispatch::AgentRpc;
