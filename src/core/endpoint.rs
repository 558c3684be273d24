//! Backend endpoint model and its stored representation.
//!
//! The distributed store holds, per service name, a JSON list of
//! `{"Url": "...", "Weight": n}` objects. An [`EndpointSet`] is the decoded,
//! immutable form; it is shared by `Arc` and replaced wholesale on updates.
use std::{ops::Deref, sync::Arc};

use serde::{Deserialize, Serialize};

/// One backend instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "Url")]
    pub address: String,
    #[serde(rename = "Weight", default)]
    pub weight: u32,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, weight: u32) -> Self {
        Self {
            address: address.into(),
            weight,
        }
    }
}

/// Ordered endpoints of one service. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointSet(Arc<[Endpoint]>);

impl EndpointSet {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self(endpoints.into())
    }

    /// Decode the stored value of a service key.
    pub fn decode(value: &[u8]) -> Result<Self, serde_json::Error> {
        let endpoints: Vec<Endpoint> = serde_json::from_slice(value)?;
        Ok(Self::new(endpoints))
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&*self.0)
    }

    pub fn total_weight(&self) -> u64 {
        self.0.iter().map(|e| u64::from(e.weight)).sum()
    }
}

impl Deref for EndpointSet {
    type Target = [Endpoint];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<Endpoint>> for EndpointSet {
    fn from(endpoints: Vec<Endpoint>) -> Self {
        Self::new(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_stored_value() {
        let raw = br#"[{"Url":"10.0.0.1","Weight":1},{"Url":"10.0.0.2","Weight":2}]"#;
        let set = EndpointSet::decode(raw).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set[0], Endpoint::new("10.0.0.1", 1));
        assert_eq!(set[1], Endpoint::new("10.0.0.2", 2));
        assert_eq!(set.total_weight(), 3);
    }

    #[test]
    fn test_missing_weight_defaults_to_zero() {
        let set = EndpointSet::decode(br#"[{"Url":"10.0.0.9:8080"}]"#).unwrap();
        assert_eq!(set[0].weight, 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(EndpointSet::decode(b"10.0.0.1").is_err());
    }

    #[test]
    fn test_encode_uses_stored_field_names() {
        let set = EndpointSet::new(vec![Endpoint::new("a", 3)]);
        let encoded = String::from_utf8(set.encode().unwrap()).unwrap();
        assert_eq!(encoded, r#"[{"Url":"a","Weight":3}]"#);
    }
}
