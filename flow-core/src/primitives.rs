//! Identifiers shared by every layer of the flow engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of one logical flow execution.
///
/// A flow id never changes for the lifetime of the flow. Ids coming in from
/// the transport must be valid UUIDs; use [`FlowId::parse`] at that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Allocate a fresh random flow id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a flow id from its textual UUID form.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a valid UUID.
    pub fn parse(value: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(value).map(Self)
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for FlowId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl std::ops::Deref for FlowId {
    type Target = Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for FlowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a session between two flows. Unique within one flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity a flow runs on behalf of: an X.500 name within a membership group.
///
/// Flows are owned by exactly one holding identity, and the execution
/// environment used to run them is selected by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldingIdentity {
    pub x500_name: String,
    pub group_id: String,
}

impl HoldingIdentity {
    pub fn new(x500_name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            x500_name: x500_name.into(),
            group_id: group_id.into(),
        }
    }
}

impl fmt::Display for HoldingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.x500_name, self.group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_id_parse_roundtrip() {
        let id = FlowId::new();
        let parsed: FlowId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_flow_id_rejects_non_uuid() {
        assert!(FlowId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_holding_identity_display() {
        let alice = HoldingIdentity::new("O=Alice, L=London, C=GB", "group-1");
        assert_eq!(alice.to_string(), "O=Alice, L=London, C=GB@group-1");
    }
}
