//! # Syncbox Common Library
//!
//! Shared code for the Syncbox peer node and session relay:
//! - Identifier types (PeerId, Locator)
//! - Peer-to-peer protocol messages
//! - Event types (SyncboxEvent) and the EventBus
//! - Configuration file resolution
//! - Common error type

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use protocol::PeerMessage;
pub use types::{Locator, PeerId, RequestId};
