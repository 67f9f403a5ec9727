//! The master's actors.
//!
//! Each actor owns one bounded inbound channel and a `run` loop; spawning
//! and wiring happens in [`crate::boot`]. Shutdown is a watch broadcast:
//! actors drain what they must, then return.

pub mod cloud_gazer;
pub mod control;
pub mod db;
pub mod import_handler;
pub mod indexer;
pub mod juggler;
pub mod lumberjack;
pub mod scribe;
pub mod secretary;
pub mod slave_driver;
pub mod status;

use std::sync::Arc;

use tokio::sync::watch;
use wheelhouse_config::MasterConfig;

pub type ShutdownRx = watch::Receiver<bool>;
pub type ShutdownTx = watch::Sender<bool>;

/// Live view of the configuration; `ReloadConfig` publishes a new value.
pub type ConfigRx = watch::Receiver<Arc<MasterConfig>>;

pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Resolves when shutdown has been signalled (or the sender is gone,
/// which can only happen on teardown).
pub async fn wait_shutdown(rx: &mut ShutdownRx) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
