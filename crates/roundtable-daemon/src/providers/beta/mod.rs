//! Backend-B: app-server subprocesses speaking JSON-RPC.

mod client;
mod instance;
mod pool;
mod threads;
mod transport;

pub use client::{BetaClient, BetaProvider, BetaStreamParser};
pub use instance::{AppServerInstance, StartupConfig, TurnConfig, TurnHandle};
pub use pool::AppServerPool;
pub use threads::ThreadRegistry;
pub use transport::JsonRpcTransport;
