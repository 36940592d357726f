//! Control surface input validation
//!
//! Locators typed by a user are checked before a request is broadcast, so
//! a typo never starts a session-wide fetch.

use crate::error::{Error, Result};
use reqwest::Url;
use syncbox_common::Locator;

/// Accepts absolute http(s) URLs, optionally restricted to a host list
#[derive(Debug, Clone, Default)]
pub struct LocatorValidator {
    /// Empty accepts any host; entries also match their subdomains
    allowed_hosts: Vec<String>,
}

impl LocatorValidator {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|host| host.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect(),
        }
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    pub fn validate(&self, input: &str) -> Result<Locator> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidLocator("empty locator".to_string()));
        }

        let url = Url::parse(input)
            .map_err(|e| Error::InvalidLocator(format!("{}: {}", input, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidLocator(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidLocator(format!("{}: missing host", input)))?
            .to_ascii_lowercase();

        if !self.allowed_hosts.is_empty() && !self.host_allowed(&host) {
            return Err(Error::InvalidLocator(format!("host '{}' is not allowed", host)));
        }

        Ok(Locator::new(input))
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|allowed| {
            host == allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}
