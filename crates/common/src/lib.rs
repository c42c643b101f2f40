//! Primitives shared by every mnemo crate: the error type, an injectable
//! clock, per-key async locks and the document metadata map.

pub mod clock;
pub mod error;
pub mod keylock;

use std::collections::BTreeMap;

pub use {
    clock::{Clock, ManualClock, SharedClock, SystemClock},
    error::{Error, ItemFailure, Result},
    keylock::{KeyGuard, KeyLocks},
};

/// Owner-supplied document metadata. Values are expected to be scalars.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Returns the first metadata key whose value is not a scalar, if any.
pub fn first_non_scalar(metadata: &Metadata) -> Option<&str> {
    metadata
        .iter()
        .find(|(_, v)| v.is_array() || v.is_object())
        .map(|(k, _)| k.as_str())
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn scalar_metadata_passes() {
        let mut meta = Metadata::new();
        meta.insert("domain".into(), json!("backend"));
        meta.insert("priority".into(), json!(3));
        meta.insert("draft".into(), json!(false));
        assert_eq!(first_non_scalar(&meta), None);
    }

    #[test]
    fn nested_metadata_is_reported() {
        let mut meta = Metadata::new();
        meta.insert("tags".into(), json!(["a", "b"]));
        assert_eq!(first_non_scalar(&meta), Some("tags"));
    }
}
