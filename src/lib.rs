pub mod accounts;
pub mod admin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod logging;
pub mod models;
pub mod server;
pub mod translate;
pub mod upstream;

pub use accounts::{AccountPool, AccountStore, LocalAccountStore, SelectionStrategy};
pub use config::GatewayConfig;
pub use dispatch::Dispatcher;
pub use error::{GatewayError, Result};
pub use logging::CallLog;
pub use server::{build_router, AppState};
pub use upstream::{Upstream, UpstreamClient};
