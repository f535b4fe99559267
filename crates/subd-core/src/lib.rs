//! subd Core - Domain model for the managed-machine reconciliation agent
//!
//! This crate contains the pieces every other subd crate agrees on:
//! - **Domain entities** - `Digest`, `Inode`, `FileSystemTree`, `Image`,
//!   `ChangeSet`, `TriggerSet`, `ReconciliationState`
//! - **Configuration** - the YAML-backed [`config::Config`]
//! - **Port definitions** - traits for the object server and the service
//!   trigger runner, implemented by adapter crates
//!
//! # Architecture
//!
//! The domain module has no I/O beyond loading and saving small JSON files.
//! Scanning, storage, diffing and the RPC surface live in their own crates
//! and exchange these types.

pub mod config;
pub mod domain;
pub mod ports;
