//! Classification-based routing enforcement.
//!
//! A stateless policy function that maps a `(classification, requested tier)`
//! pair to the tier actually allowed. This is the one place the
//! information-flow policy is decided; the router calls it *before* reading
//! any other option so that no mode, cap, or fallback path can override it.

use crate::classification::ClassificationLevel;

use super::tier::Tier;

/// Outcome of an enforcement check.
#[derive(Debug, Clone, PartialEq)]
pub struct Enforcement {
    /// The tier the query may actually use.
    pub tier: Tier,
    /// Audit reason when the requested tier was denied, `None` when the
    /// request passed through unchanged.
    pub denial: Option<String>,
}

impl Enforcement {
    fn allowed(tier: Tier) -> Self {
        Self { tier, denial: None }
    }
}

/// Apply the information-flow policy to a requested tier.
///
/// Rules, in order:
///
/// 1. `Unclassified` with neither offline nor paranoid mode active: the
///    requested tier passes through unchanged.
/// 2. Paranoid or offline mode: force `Local` (a `Cache` request for an
///    unclassified query may keep the cache — it never leaves the host).
/// 3. `Cui` and above: force `Local` with a denial reason. This rule wins
///    over every mode, cap, and fallback; it is checked first below so no
///    later branch can shadow it.
pub fn enforce(
    classification: ClassificationLevel,
    requested: Tier,
    offline: bool,
    paranoid: bool,
) -> Enforcement {
    // Rule 3 first: classification outranks every mode flag.
    if classification.blocks_cloud() {
        if requested.is_local() {
            // Local destinations are always permitted, at any level.
            return Enforcement::allowed(requested);
        }
        return Enforcement {
            tier: Tier::Local,
            denial: Some(format!(
                "{classification} classification blocks cloud routing (requested {requested})"
            )),
        };
    }

    if paranoid || offline {
        if requested == Tier::Cache {
            return Enforcement::allowed(Tier::Cache);
        }
        if requested == Tier::Local {
            return Enforcement::allowed(Tier::Local);
        }
        let mode = if paranoid { "paranoid" } else { "offline" };
        return Enforcement {
            tier: Tier::Local,
            denial: Some(format!("{mode} mode blocks cloud routing (requested {requested})")),
        };
    }

    Enforcement::allowed(requested)
}
