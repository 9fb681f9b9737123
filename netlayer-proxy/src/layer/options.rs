//! Per-call connection options

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Cap on establishing a TCP connection, in milliseconds
pub const CONNECT_TIMEOUT_MS: &str = "connect_timeout_ms";

/// String properties handed to `connect`/`listen`.
///
/// Decorators pass them through untouched; each layer reads the keys it
/// understands and ignores the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Options(BTreeMap<String, String>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Read a millisecond value; absent, unparsable and zero all mean "none"
    pub fn millis(&self, key: &str) -> Option<Duration> {
        match self.get(key)?.trim().parse::<u64>() {
            Ok(0) => None,
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => {
                tracing::debug!("Ignoring non-numeric option {}={:?}", key, self.get(key));
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis() {
        let options = Options::new()
            .with(CONNECT_TIMEOUT_MS, 250)
            .with("zero", 0)
            .with("junk", "soon");

        assert_eq!(options.millis(CONNECT_TIMEOUT_MS), Some(Duration::from_millis(250)));
        assert_eq!(options.millis("zero"), None);
        assert_eq!(options.millis("junk"), None);
        assert_eq!(options.millis("missing"), None);
    }

    #[test]
    fn test_parse_toml() {
        let options: Options = toml::from_str(r#"connect_timeout_ms = "5000""#).unwrap();
        assert_eq!(options.get(CONNECT_TIMEOUT_MS), Some("5000"));
        assert!(!options.is_empty());
    }
}
