//! Closed set of engine subsystems that callers can be handed directly.

use std::{fmt, str::FromStr};

use {mnemo_common::Error, mnemo_vault::Vault, serde::{Deserialize, Serialize}};

use crate::{
    cache::CachingManager, chunker::Chunker, partition::PartitionManager, tiers::TieredStorage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Cache,
    Storage,
    Security,
    Chunking,
    Partition,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 5] = [
        Self::Cache,
        Self::Storage,
        Self::Security,
        Self::Chunking,
        Self::Partition,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Storage => "storage",
            Self::Security => "security",
            Self::Chunking => "chunking",
            Self::Partition => "partition",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidInput(format!("unknown capability: {s}")))
    }
}

/// Borrowed handle to one subsystem of a running engine.
#[derive(Debug, Clone, Copy)]
pub enum Capability<'a> {
    Cache(&'a CachingManager),
    Storage(&'a TieredStorage),
    Security(&'a Vault),
    Chunking(&'a Chunker),
    Partition(&'a PartitionManager),
}

impl Capability<'_> {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Cache(_) => CapabilityKind::Cache,
            Self::Storage(_) => CapabilityKind::Storage,
            Self::Security(_) => CapabilityKind::Security,
            Self::Chunking(_) => CapabilityKind::Chunking,
            Self::Partition(_) => CapabilityKind::Partition,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, rstest::rstest};

    #[rstest]
    #[case("cache", CapabilityKind::Cache)]
    #[case(" Storage ", CapabilityKind::Storage)]
    #[case("SECURITY", CapabilityKind::Security)]
    #[case("partition", CapabilityKind::Partition)]
    fn parses_names(#[case] input: &str, #[case] expected: CapabilityKind) {
        assert_eq!(input.parse::<CapabilityKind>().unwrap(), expected);
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            "vector".parse::<CapabilityKind>(),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        for kind in CapabilityKind::ALL {
            assert_eq!(kind.to_string().parse::<CapabilityKind>().unwrap(), kind);
        }
    }
}
