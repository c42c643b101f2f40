//! Records shared by storage, cache and the engine.

use std::fmt;

use {
    mnemo_common::Metadata,
    serde::{Deserialize, Serialize},
};

/// Storage class. Documents enter HOT and move only during migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }

    /// One tier up, `None` for HOT.
    pub fn warmer(self) -> Option<Tier> {
        match self {
            Self::Hot => None,
            Self::Warm => Some(Self::Hot),
            Self::Cold => Some(Self::Warm),
        }
    }

    /// One tier down, `None` for COLD.
    pub fn colder(self) -> Option<Tier> {
        match self {
            Self::Hot => Some(Self::Warm),
            Self::Warm => Some(Self::Cold),
            Self::Cold => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted document record. `content` holds the sealed bytes when
/// `encrypted` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub metadata: Metadata,
    pub owner: String,
    pub created_ms: u64,
    pub modified_ms: u64,
    pub partition_id: String,
    pub tier: Tier,
    pub encrypted: bool,
    #[serde(default)]
    pub pii_flagged: bool,
    #[serde(default)]
    pub chunk_count: usize,
}

/// Sub-span of a document used for semantic indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub parent_key: String,
    pub index: usize,
    pub text: String,
    /// Words shared with the previous chunk.
    pub overlap_words: usize,
    pub start_word: usize,
    pub end_word: usize,
}

impl Chunk {
    /// Id under which the chunk is stored in the vector index.
    pub fn vector_id(&self) -> String {
        chunk_vector_id(&self.parent_key, self.index)
    }
}

pub fn chunk_vector_id(parent_key: &str, index: usize) -> String {
    format!("{parent_key}#{index}")
}

/// Decrypted document handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub key: String,
    pub content: String,
    pub metadata: Metadata,
    pub partition_id: String,
    pub created_ms: u64,
    pub modified_ms: u64,
    /// Similarity score when the document came from a search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

mod base64_bytes {
    use {
        base64::{Engine as _, engine::general_purpose::STANDARD},
        serde::{Deserialize, Deserializer, Serializer, de::Error},
    };

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, serde_json::json};

    #[test]
    fn tier_neighbours() {
        assert_eq!(Tier::Hot.colder(), Some(Tier::Warm));
        assert_eq!(Tier::Cold.colder(), None);
        assert_eq!(Tier::Cold.warmer(), Some(Tier::Warm));
        assert_eq!(Tier::Hot.warmer(), None);
        assert_eq!(Tier::Warm.to_string(), "warm");
    }

    #[test]
    fn document_content_serializes_as_base64() {
        let doc = Document {
            key: "k".into(),
            content: vec![0, 159, 255],
            metadata: Metadata::new(),
            owner: "alice".into(),
            created_ms: 1,
            modified_ms: 2,
            partition_id: "default".into(),
            tier: Tier::Hot,
            encrypted: true,
            pii_flagged: false,
            chunk_count: 1,
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["content"], json!("AJ//"));
        assert_eq!(value["tier"], json!("hot"));
        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }
}
