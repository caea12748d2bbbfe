//! Common data types for Operator Call components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a call session.
///
/// This is the UUID the OS call UI knows the call by; every intent coming
/// back from the OS carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CallId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a media session on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_round_trips_through_string() {
        let id = CallId::new();
        let parsed: CallId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_call_id_serializes_as_plain_uuid() {
        let id: CallId = "6f1c2a4e-7d1b-4a59-9a57-0d2b1f0e5c11".parse().expect("parse");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"6f1c2a4e-7d1b-4a59-9a57-0d2b1f0e5c11\"");
    }

    #[test]
    fn test_call_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<CallId>().is_err());
    }
}
