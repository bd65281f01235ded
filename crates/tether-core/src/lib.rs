//! Tether Core - RPC transport for driving a remote document engine.
//!
//! A thin client mirrors an engine's API while every call executes on a server
//! process. This crate holds both ends of the wire:
//!
//! - [`client::TransportClient`] correlates requests with responses over one
//!   long-lived connection, reassembles chunked results, queues requests while
//!   offline and replays them on reconnect.
//! - [`server::RpcServer`] dispatches requests against a [`MethodRegistry`],
//!   streams large array results in chunks, and drives mutation-burst autosave.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{callable, ClientConfig, TransportClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let client = TransportClient::start(ClientConfig::new("127.0.0.1:7400"))?;
//!     let docs = client.collection("docs");
//!
//!     docs.call("insert", vec![json!({"id": "a", "text": "hello world"})]).await?;
//!     let hits = docs
//!         .call("search", vec![json!("hello"), json!({"topK": 5, "filter": callable("d => d.id != 'b'")})])
//!         .await?;
//!     println!("{}", hits);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use client::{CollectionHandle, LinkState, RequestOptions, TransportClient};
pub use config::{AutosaveConfig, AutosaveMode, ClientConfig, ProtocolConfig, ServerConfig};
pub use error::{EngineError, Result, TetherError};
pub use filter::{FilterError, Predicate};
pub use protocol::{callable, HealthStatus, StreamComplete};
pub use server::{
    CallArgs, HandlerResult, MethodRegistry, NoPersistence, Persistence, RpcServer,
    RpcServerHandle,
};
