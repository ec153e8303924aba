//! Information-sensitivity labels attached to queries and sessions.
//!
//! [`ClassificationLevel`] is a total order: `Unclassified < Cui <
//! Confidential < Secret < TopSecret`. `Unclassified` is the only level that
//! may ever leave the host; everything at `Cui` and above is pinned to local
//! inference by the routing enforcer regardless of any other option.

use serde::{Deserialize, Serialize};

/// Data-classification level of a query or session.
///
/// Ordering is significant — `#[derive(PartialOrd, Ord)]` gives the variant
/// order declared here, and the router compares with `>= Cui` to decide
/// whether cloud routing is permitted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationLevel {
    /// Publicly releasable. The only level allowed off-host.
    #[default]
    Unclassified,
    /// Controlled Unclassified Information. On-premise only.
    Cui,
    Confidential,
    Secret,
    TopSecret,
}

impl ClassificationLevel {
    /// Canonical textual form, matching the accepted parse spellings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unclassified => "UNCLASSIFIED",
            Self::Cui => "CUI",
            Self::Confidential => "CONFIDENTIAL",
            Self::Secret => "SECRET",
            Self::TopSecret => "TOP_SECRET",
        }
    }

    /// Whether this level forbids any off-host routing.
    pub fn blocks_cloud(&self) -> bool {
        *self >= Self::Cui
    }
}

impl std::fmt::Display for ClassificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a classification string is not a canonical spelling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised classification level: {0:?}")]
pub struct ParseClassificationError(pub String);

impl std::str::FromStr for ClassificationLevel {
    type Err = ParseClassificationError;

    /// Parse a textual classification marking.
    ///
    /// Accepts the canonical spellings case-insensitively. Empty input maps
    /// to `Unclassified` (unmarked data is treated as unclassified, the
    /// lowest level — the routing enforcer is what keeps this safe, since a
    /// session tagged higher can never be downgraded).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::Unclassified);
        }
        match trimmed.to_ascii_uppercase().as_str() {
            "UNCLASSIFIED" | "U" => Ok(Self::Unclassified),
            "CUI" => Ok(Self::Cui),
            "CONFIDENTIAL" | "C" => Ok(Self::Confidential),
            "SECRET" | "S" => Ok(Self::Secret),
            "TOP_SECRET" | "TOP SECRET" | "TS" => Ok(Self::TopSecret),
            _ => Err(ParseClassificationError(trimmed.to_string())),
        }
    }
}

/// High-water classification mark for a session.
///
/// Once a session has carried material at level L, later queries in that
/// session route at L or above — relabelling a message cannot downgrade the
/// session. Thread-safe; stores the level as its variant index.
#[derive(Debug, Default)]
pub struct SessionLabel {
    level: std::sync::atomic::AtomicU8,
}

impl SessionLabel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the session to at least `level`. Lower levels are ignored.
    pub fn elevate(&self, level: ClassificationLevel) {
        use std::sync::atomic::Ordering;
        self.level.fetch_max(level as u8, Ordering::AcqRel);
    }

    /// Effective level for a query labelled `requested`: the higher of the
    /// request label and the session's high-water mark. Also raises the
    /// mark, so the elevation sticks.
    pub fn effective(&self, requested: ClassificationLevel) -> ClassificationLevel {
        use std::sync::atomic::Ordering;
        self.elevate(requested);
        match self.level.load(Ordering::Acquire) {
            0 => ClassificationLevel::Unclassified,
            1 => ClassificationLevel::Cui,
            2 => ClassificationLevel::Confidential,
            3 => ClassificationLevel::Secret,
            _ => ClassificationLevel::TopSecret,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn ordering_is_total_and_ascending() {
        use ClassificationLevel::*;
        assert!(Unclassified < Cui);
        assert!(Cui < Confidential);
        assert!(Confidential < Secret);
        assert!(Secret < TopSecret);
    }

    #[test]
    fn parse_accepts_canonical_spellings() {
        use ClassificationLevel::*;
        for (text, level) in [
            ("UNCLASSIFIED", Unclassified),
            ("CUI", Cui),
            ("CONFIDENTIAL", Confidential),
            ("SECRET", Secret),
            ("TOP_SECRET", TopSecret),
        ] {
            assert_eq!(ClassificationLevel::from_str(text).unwrap(), level);
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(
            ClassificationLevel::from_str("cui").unwrap(),
            ClassificationLevel::Cui
        );
        assert_eq!(
            ClassificationLevel::from_str("Top_Secret").unwrap(),
            ClassificationLevel::TopSecret
        );
    }

    #[test]
    fn empty_input_defaults_to_unclassified() {
        assert_eq!(
            ClassificationLevel::from_str("").unwrap(),
            ClassificationLevel::Unclassified
        );
        assert_eq!(
            ClassificationLevel::from_str("   ").unwrap(),
            ClassificationLevel::Unclassified
        );
    }

    #[test]
    fn unknown_input_is_a_parse_error() {
        assert!(ClassificationLevel::from_str("PUBLIC").is_err());
        assert!(ClassificationLevel::from_str("SECRET//NOFORN-ish").is_err());
    }

    #[test]
    fn round_trips_through_display() {
        use ClassificationLevel::*;
        for level in [Unclassified, Cui, Confidential, Secret, TopSecret] {
            assert_eq!(
                ClassificationLevel::from_str(&level.to_string()).unwrap(),
                level
            );
        }
    }

    #[test]
    fn session_label_never_downgrades() {
        let session = SessionLabel::new();
        assert_eq!(
            session.effective(ClassificationLevel::Unclassified),
            ClassificationLevel::Unclassified
        );

        // One SECRET query raises the session for good.
        assert_eq!(
            session.effective(ClassificationLevel::Secret),
            ClassificationLevel::Secret
        );
        assert_eq!(
            session.effective(ClassificationLevel::Unclassified),
            ClassificationLevel::Secret,
            "a later unclassified query still routes at the session mark"
        );
        assert_eq!(
            session.effective(ClassificationLevel::TopSecret),
            ClassificationLevel::TopSecret
        );
    }

    #[test]
    fn blocks_cloud_for_cui_and_above() {
        use ClassificationLevel::*;
        assert!(!Unclassified.blocks_cloud());
        for level in [Cui, Confidential, Secret, TopSecret] {
            assert!(level.blocks_cloud(), "{level} must block cloud");
        }
    }
}
