//! Server-side endpoint names.
//!
//! Endpoint names end up as path components (UNIX sockets), pipe names, or
//! property keys, so they are checked once here before anything derives a
//! location from them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IpcError;

/// Characters that may never appear in an endpoint name.
const FORBIDDEN: [char; 5] = ['/', '\\', '\0', '\n', '.'];

/// Returns `true` if `name` can be used as an endpoint name.
pub fn validate(name: &str) -> bool {
    !name.is_empty() && !name.contains(FORBIDDEN)
}

/// A validated endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointName(String);

impl EndpointName {
    /// Validate `name` and wrap it.
    pub fn new(name: impl Into<String>) -> Result<Self, IpcError> {
        let name = name.into();
        if validate(&name) {
            Ok(Self(name))
        } else {
            Err(IpcError::InvalidEndpointName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EndpointName {
    type Error = IpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EndpointName> for String {
    fn from(name: EndpointName) -> Self {
        name.0
    }
}

impl std::str::FromStr for EndpointName {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for EndpointName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
