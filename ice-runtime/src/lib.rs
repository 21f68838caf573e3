//! Async client/server runtime for the ice RPC protocol.
//!
//! This crate connects to remote objects over TCP, UDP and WebSocket
//! transports, frames requests in the ice wire protocol and tracks them
//! until their replies arrive. It is built on [Tokio](https://tokio.rs/) and
//! exposes every remote call as an `async fn`.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ice_runtime::{Communicator, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let communicator = Communicator::new(RuntimeConfig::default())?;
//!     let hello = communicator
//!         .string_to_proxy("hello:tcp -h 127.0.0.1 -p 10000")?
//!         .ok_or("null proxy")?;
//!
//!     // Twoway call with no parameters.
//!     let reply = hello.invoke("sayHello", Default::default(), &[]).await?;
//!     println!("{} result bytes", reply.payload.len());
//!
//!     communicator.destroy().await;
//!     Ok(())
//! }
//! ```
//!
//! # Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`proxy`], [`reference`] | what a proxy points at and how it is invoked |
//! | [`invocation`] | request marshaling, completion, retry and cancellation |
//! | [`handler`] | binds a proxy to a connection, or to a collocated adapter |
//! | [`connection`], [`acm`] | multiplexed connections and idle management |
//! | [`endpoint`], [`transport`] | transport addresses, connectors and byte streams |
//! | [`locator`], [`router`] | indirect proxy resolution caches |
//! | [`adapter`] | servants and the dispatch pipeline |
//! | [`batch`] | batched oneway requests |
//!
//! # Configuration
//!
//! Use [`RuntimeConfig::builder()`](RuntimeConfig::builder), or build the
//! configuration from `Ice.*` properties:
//!
//! ```rust
//! use ice_runtime::{Properties, RuntimeConfig};
//!
//! let props = Properties::new();
//! props.set_property("Ice.Default.Timeout", "5000");
//! props.set_property("Ice.RetryIntervals", "0 100 500");
//! let config = RuntimeConfig::from_properties(&props);
//! assert_eq!(config.default_timeout(), 5000);
//! ```
//!
//! # Logging
//!
//! The runtime emits [`tracing`] events. Protocol, network, retry, locator
//! and ACM tracing use the `ice::protocol`, `ice::network`, `ice::retry`,
//! `ice::locator` and `ice::acm` targets and are enabled by the matching
//! `Ice.Trace.*` levels.

#![warn(missing_docs)]

pub mod acm;
pub mod adapter;
pub mod batch;
mod communicator;
pub mod config;
#[cfg(feature = "config-file")]
pub mod config_file;
pub mod connection;
pub mod endpoint;
pub mod handler;
pub mod instance;
pub mod invocation;
pub mod locator;
pub mod observer;
pub mod properties;
pub mod proxy;
pub mod reference;
pub mod router;
pub mod runtime;
pub mod timer;
pub mod transport;

pub use acm::{AcmClose, AcmConfig, AcmHeartbeat};
pub use adapter::{Current, Dispatcher, IncomingRequest, ObjectAdapter, OutgoingResponse, Servant};
pub use batch::{BatchRequest, BatchRequestInterceptor};
pub use communicator::Communicator;
pub use config::{ConfigError, EndpointSelection, Overrides, RuntimeConfig, RuntimeConfigBuilder, TraceLevels};
#[cfg(feature = "config-file")]
pub use config_file::FileConfig;
pub use connection::{CloseMode, Connection, ConnectionEvent, ConnectionId};
pub use endpoint::Endpoint;
pub use ice_core as core;
pub use ice_core::{Context, IceError, Identity, Result};
pub use instance::InitializationData;
pub use invocation::{InvocationFuture, Reply};
pub use locator::{Locator, LocatorPrx};
pub use observer::{CommunicatorObserver, NoopObserver};
pub use properties::Properties;
pub use proxy::ObjectPrx;
pub use reference::InvocationMode;
pub use router::{Router, RouterPrx};
pub use runtime::{Runtime, TokioRuntime};
