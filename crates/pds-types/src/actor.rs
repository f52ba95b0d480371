use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Identifier of the actor that owns a repo (a DID such as `did:plc:abc123`).
///
/// Every actor's repo is an independent storage unit; the id selects which
/// one an operation addresses.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(String);

impl ActorId {
    /// Parse a `did:<method>:<id>` identifier.
    pub fn new(did: impl Into<String>) -> Result<Self, TypeError> {
        let did = did.into();
        let mut parts = did.splitn(3, ':');
        let valid = parts.next() == Some("did")
            && parts
                .next()
                .is_some_and(|m| !m.is_empty() && m.bytes().all(|b| b.is_ascii_lowercase()))
            && parts
                .next()
                .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_graphic()));
        if !valid || did.len() > 2048 {
            return Err(TypeError::InvalidActor(did));
        }
        Ok(Self(did))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe, injective rendering of the id.
    ///
    /// ASCII alphanumerics, `.` and `-` pass through; every other byte
    /// becomes `_` followed by two hex digits.
    pub fn file_stem(&self) -> String {
        let mut out = String::with_capacity(self.0.len() + 8);
        for b in self.0.bytes() {
            if b.is_ascii_alphanumeric() || b == b'.' || b == b'-' {
                out.push(b as char);
            } else {
                out.push('_');
                out.push_str(&hex::encode([b]));
            }
        }
        out
    }
}

impl TryFrom<String> for ActorId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ActorId> for String {
    fn from(id: ActorId) -> Self {
        id.0
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.0)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
