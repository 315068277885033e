use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Names a destination on a transport
///
/// `route` addresses the transport endpoint (broker host, in-process
/// namespace), `name` the queue or topic behind it. Parameters keep their
/// insertion order, so two descriptors built the same way share a key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    route: String,
    name: String,
    #[serde(default)]
    params: Vec<(String, String)>,
    #[serde(skip)]
    key: OnceLock<String>,
}

impl ConnectionDescriptor {
    pub fn new(route: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            name: name.into(),
            params: Vec::new(),
            key: OnceLock::new(),
        }
    }

    /// Append a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self.key = OnceLock::new();
        self
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Look up the first parameter with the given key
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Derived identity `route/name?k=v&...`, computed on first use
    pub fn key(&self) -> &str {
        self.key.get_or_init(|| {
            let mut key = format!("{}/{}", self.route, self.name);
            for (i, (k, v)) in self.params.iter().enumerate() {
                key.push(if i == 0 { '?' } else { '&' });
                key.push_str(k);
                key.push('=');
                key.push_str(v);
            }
            key
        })
    }

    /// Reject descriptors that cannot address anything
    pub fn validate(&self) -> Result<()> {
        if self.route.trim().is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "empty route for destination {:?}",
                self.name
            )));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "empty destination name on route {:?}",
                self.route
            )));
        }
        Ok(())
    }
}

impl PartialEq for ConnectionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ConnectionDescriptor {}

impl Hash for ConnectionDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
