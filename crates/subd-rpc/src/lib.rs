//! subd RPC - The reconciliation protocol
//!
//! This crate provides:
//! - [`SubService`] - Poll, Fetch, Update, Cleanup, Get/SetConfiguration
//!   and GetFiles over the shared [`ReconciliationState`](subd_core::domain::ReconciliationState)
//! - [`RpcServer`] - the HTTP/1 transport in front of the service
//! - [`ObjectServerClient`] - the object server adapter used by Fetch
//!
//! ## Modules
//!
//! - [`messages`] - request and response bodies
//! - [`service`] - protocol operations
//! - [`server`] - HTTP routing
//! - [`client`] - object server client and connector
//! - [`netbench`] - the saved network benchmark

pub mod client;
pub mod error;
pub mod messages;
pub mod netbench;
pub mod server;
pub mod service;

pub use client::{HttpObjectServerConnector, ObjectServerClient};
pub use error::RpcError;
pub use netbench::{load_netbench, save_netbench};
pub use server::RpcServer;
pub use service::{ServiceSettings, SubService};
