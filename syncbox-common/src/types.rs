//! Identifier types shared across the session
//!
//! Peer ids are assigned by the session layer and stay stable for the
//! life of a session. Locators are opaque: two requests carrying the same
//! locator refer to the same resource no matter who issued them.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Identifier minted by the requester for one playback request
pub type RequestId = Uuid;

/// Participant identifier assigned by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl PeerId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

impl From<u32> for PeerId {
    fn from(id: u32) -> Self {
        PeerId(id)
    }
}

/// Opaque identifier of a remote audio resource (usually a URL)
///
/// The sole key for caching and readiness tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(locator: impl Into<String>) -> Self {
        Locator(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Locator {
    fn from(s: &str) -> Self {
        Locator(s.to_string())
    }
}

impl From<String> for Locator {
    fn from(s: String) -> Self {
        Locator(s)
    }
}

impl AsRef<str> for Locator {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Locator {
    fn borrow(&self) -> &str {
        &self.0
    }
}
