//! Edge Stream Agent - 接收远程命令，监管本机视频推流进程

pub mod bridge;
pub mod broker;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod envelope;
pub mod relay;
pub mod supervisor;

pub use bridge::{CliBridge, MockBridge, NativeBridge};
pub use broker::BrokerClient;
pub use config::{AgentConfig, BrokerSettings, RelaySettings};
pub use controller::AgentController;
pub use dispatcher::CommandDispatcher;
pub use envelope::{CommandEnvelope, ResponseEnvelope};
pub use relay::RelayBackend;
pub use supervisor::{StreamState, StreamStatus, StreamSupervisor};
