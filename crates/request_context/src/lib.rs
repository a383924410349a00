//! `RequestId`: the identifier threaded through every subsystem that needs
//! to correlate work with a single in-flight request (the response sink,
//! the background-request coordinator, trace/log lines, ...).

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A request id is a lower-case 16-digit hex rendering of a monotonically
/// increasing global counter. Monotonic rather than random so request ids
/// sort in arrival order and never collide within a process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Derive a request id directly from the transport's own monotonically
    /// increasing global id (`rpc.globalId`), per §3/§4.1: the core never
    /// mints its own id when one is available from the transport.
    pub fn from_global_id(global_id: u64) -> Self {
        Self(global_id)
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn new_for_test() -> Self {
        Self::new()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(
            s.len() == 16 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
            "invalid request id {s:?}: expected 16 lower-case hex digits"
        );
        Ok(Self(u64::from_str_radix(s, 16)?))
    }
}

impl serde::Serialize for RequestId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for RequestId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::RequestId;

    #[test]
    fn request_ids_are_monotonically_increasing() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert!(a < b);
    }

    #[test]
    fn display_renders_16_lowercase_hex_digits() {
        let id = RequestId::new();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 16);
        assert!(rendered.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn round_trips_through_display_and_from_str() {
        let id = RequestId::new();
        let parsed = RequestId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_str_rejects_malformed_ids() {
        assert!(RequestId::from_str("too-short").is_err());
        assert!(RequestId::from_str("ABCDEFABCDEFABCD").is_err());
        assert!(RequestId::from_str("0123456789abcdeg").is_err());
    }
}
