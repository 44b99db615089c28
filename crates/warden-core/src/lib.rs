//! Game supervision core: the transport contract with its local and remote
//! implementations, the per-game run/restart loop, and the game manager.

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod game;
pub mod local;
pub mod manager;
pub mod remote;
pub mod transport;

pub use bridge::{GameEvent, OutputBridge, StopReason};
pub use config::{GameConfig, RemoteConfig, TransportConfig};
pub use error::{GameError, ManagerError, TransportError};
pub use game::{Game, GameStatus};
pub use local::LocalTransport;
pub use manager::{Manager, ReloadSummary};
pub use remote::RemoteTransport;
pub use transport::{RunOutcome, StdioSender, Transport, transport_from_config};
pub use warden_process::{ExitInfo, ProcessSpec, ProcessState, ProcessStatus, Stream};
