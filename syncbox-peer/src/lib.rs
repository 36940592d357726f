//! # Syncbox Peer (syncbox-peer)
//!
//! Synchronized playback of a remotely fetched audio resource across the
//! peers of a shared session.
//!
//! **Protocol:** a requester broadcasts a locator; every peer fetches and
//! decodes it into its own cache and reports ready; once every member has
//! reported, the requester broadcasts the play command and every peer
//! starts the requester's endpoint from its local buffer.
//!
//! **Architecture:** Resource Cache, Readiness Tracker, Fetch-and-Decode
//! Pipeline, Playback Coordinator and Endpoint Registry are owned by a
//! [`PeerNode`], which pumps inbound session traffic. The session layer,
//! fetch and decode backends and playback devices are traits.

pub mod api;
pub mod cache;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod node;
pub mod pipeline;
pub mod readiness;
pub mod session;

pub use error::{Error, Result};
pub use node::{NodeServices, NodeSettings, PeerNode};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked
///
/// Protocol state stays consistent across a panicking holder: every
/// critical section is a single insert or read.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
