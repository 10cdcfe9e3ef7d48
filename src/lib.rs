// 远程维护 Agent 库
//
// 导出所有公共模块供二进制入口和测试使用

pub mod backoff;
pub mod beacon;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod framing;
pub mod http;
pub mod modules;
pub mod obfuscation;
pub mod session;
pub mod state;
pub mod urlgen;

// 重新导出常用类型
pub use backoff::LinearBackoff;
pub use beacon::BeaconOutcome;
pub use config::{AgentConfig, ConnectionMode, SharedState};
pub use controller::Controller;
pub use dispatch::{CommandEnvelope, CommandReport, Dispatcher};
pub use error::{AgentError, Result};
pub use executor::CommandExecutor;
pub use framing::SecureConn;
pub use http::HttpClient;
pub use modules::{BuiltinCommand, ModuleRegistry};
pub use obfuscation::ObfuscationMap;
pub use session::SessionOutcome;
pub use state::{StateSnapshot, StateVault};
