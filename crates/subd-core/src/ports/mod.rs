//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! reconciliation engine. The domain and the protocol service depend on
//! these interfaces; their implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IObjectServer`] - Content-addressed object server (fetch source)
//! - [`IObjectServerConnector`] - Builds an object server client per address
//! - [`IServiceRunner`] - Stops and starts services named by triggers

pub mod object_server;
pub mod service_runner;

pub use object_server::{FetchedObject, IObjectServer, IObjectServerConnector, ObjectChunks};
pub use service_runner::IServiceRunner;
