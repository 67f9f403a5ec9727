//! # Wheelhouse master
//!
//! Single-process orchestrator for a fleet of wheel-building slaves.
//!
//! ## Overview
//!
//! The master hosts a set of long-lived actors communicating over bounded
//! in-process channels, with sockets only at the network boundary:
//!
//! - **Cloud gazer**: polls the upstream index for new package versions
//! - **Slave driver**: dispatches builds and tracks slave lifecycles
//! - **File juggler**: receives, verifies and installs build artifacts
//! - **Scribe / indexer**: regenerate the static index pages on change
//! - **Secretary / database pool**: serialize all writes into Postgres
//! - **Status / control / lumberjack**: monitoring, administration and
//!   download-log ingestion
//!
//! No shared mutable state crosses actor boundaries; the database and the
//! filesystem are each owned by exactly one side of the graph.

pub mod boot;
pub mod proto;
pub mod store;
pub mod tasks;
