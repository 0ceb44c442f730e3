//! Node identity — a 128-bit opaque id with two equivalent views: 16 raw
//! bytes for the wire, and a canonical text form for the operator surface.

use std::fmt;

use uuid::Uuid;

/// A node's unique identifier within the community.
///
/// Uniqueness is probabilistic (backed by UUIDv4 random bits); collision
/// tolerance is out of scope, matching spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdentity(Uuid);

impl NodeIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identity from its canonical text form (e.g. the operator
    /// supplied a fixed node id).
    pub fn parse(text: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(text).map(Self)
    }

    /// The 16-byte wire form.
    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Reconstruct an identity from its 16-byte wire form.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Canonical text form, used only at the operator surface.
    pub fn to_text(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let id = NodeIdentity::generate();
        let back = NodeIdentity::from_bytes(id.as_bytes());
        assert_eq!(id, back);
    }

    #[test]
    fn roundtrips_through_text() {
        let id = NodeIdentity::generate();
        let text = id.to_text();
        let back = NodeIdentity::parse(&text).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn two_generated_ids_differ() {
        assert_ne!(NodeIdentity::generate(), NodeIdentity::generate());
    }
}
