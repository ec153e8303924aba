//! Query routing — the decision of *where* a query may be answered.
//!
//! The pipeline is classification-first by construction:
//!
//! 1. Bound the query length.
//! 2. Grade the query ([`complexity`]) and derive the recommended tier.
//! 3. Ask the [`enforcement`] policy whether that destination is permitted.
//!    A `Cui`-or-above classification, paranoid mode, or offline mode each
//!    pin a remote recommendation to the local tier before any other
//!    option — `max_tier`, routing mode, credentials — is even read. The
//!    enforcer sees the *actual* recommendation, so a trivial query under
//!    paranoid mode keeps the on-host cache instead of being bounced to the
//!    daemon.
//!
//! The ordering matters: applying a `max_tier` cap before the classification
//! check would let a caller route classified material to a capped-but-still
//! -remote tier. The tests pin this down.

pub mod complexity;
pub mod enforcement;
pub mod stats;
pub mod tier;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classification::ClassificationLevel;

pub use complexity::{classify_complexity, QueryComplexity, QueryType};
pub use stats::{SessionStats, StatsSnapshot};
pub use tier::Tier;

/// Queries longer than this are refused cloud routing outright and pinned to
/// the local daemon — oversized payloads are a data-exfiltration smell.
pub const MAX_QUERY_LENGTH: usize = 100_000;

/// How the caller wants routing to behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Pick the tier from the query grade; cloud allowed when credentialed.
    #[default]
    Auto,
    /// Same decision rule as `Auto`; kept distinct for config compatibility.
    Hybrid,
    /// Never leave the host.
    Local,
    /// Grade-driven like `Auto`; a remote recommendation without a
    /// credential degrades to `Local` rather than failing.
    Cloud,
}

/// Per-call routing options. Populate `offline` from the offline guard.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteOptions {
    pub mode: RoutingMode,
    pub max_tier: Option<Tier>,
    pub paranoid: bool,
    pub offline: bool,
    /// Whether a remote credential is configured. Without one, every remote
    /// recommendation degrades to `Local`.
    pub has_cloud_key: bool,
}

/// Immutable routing decision, produced once per query.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub tier: Tier,
    pub complexity: QueryComplexity,
    pub query_type: QueryType,
    pub estimated_cost_cents: f64,
    pub reason: String,
    /// Local model-capability hint (`"fast"` | `"code"` | `"reasoning"`),
    /// resolved against the `[local.models]` config map at dispatch time;
    /// `None` when the remote gateway picks the model.
    pub selected_model: Option<String>,
    pub is_auto_routed: bool,
}

/// Result of executing a routed query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub response: String,
    pub tier_used: Tier,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub cost_cents: f64,
}

impl QueryResult {
    /// A completed inference result; cost follows from the tier and tokens.
    pub fn new(
        response: String,
        tier: Tier,
        input_tokens: u32,
        output_tokens: u32,
        latency_ms: u64,
    ) -> Self {
        Self {
            response,
            tier_used: tier,
            input_tokens,
            output_tokens,
            latency_ms,
            cache_hit: false,
            cost_cents: tier.cost_cents(input_tokens, output_tokens),
        }
    }

    /// A cache hit: free, no tokens consumed.
    pub fn cache_hit(response: String, latency_ms: u64) -> Self {
        Self {
            response,
            tier_used: Tier::Cache,
            input_tokens: 0,
            output_tokens: 0,
            latency_ms,
            cache_hit: true,
            cost_cents: 0.0,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Estimate the token count of a text.
///
/// Blends a word-based estimate (≈ 4 tokens per 3 words) with a
/// character-based one (≈ 4 chars per token); real tokenizers land between
/// the two for English and code alike.
pub fn estimate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count() as f64;
    let chars = text.chars().count() as f64;
    let blended = (words * 4.0 / 3.0 + chars / 4.0) / 2.0;
    blended.ceil().max(1.0) as u32
}

/// Convenience form: route and return only the tier.
pub fn route_query(
    query: &str,
    classification: ClassificationLevel,
    opts: RouteOptions,
) -> Tier {
    route_query_detailed(query, classification, opts).tier
}

/// Full routing decision for a query.
pub fn route_query_detailed(
    query: &str,
    classification: ClassificationLevel,
    opts: RouteOptions,
) -> RoutingDecision {
    let complexity = classify_complexity(query);
    let query_type = QueryType::classify(query);

    // Oversized queries never leave the host.
    if query.chars().count() > MAX_QUERY_LENGTH {
        return local_decision(
            complexity,
            query_type,
            format!(
                "query exceeds {MAX_QUERY_LENGTH} characters -> Local tier (length bound)"
            ),
        );
    }

    // Grade-driven recommendation. Generative intents warrant the remote
    // tier once the query is non-trivial, even if the grade alone would
    // have kept it local.
    let mut recommended = complexity.min_tier();
    if matches!(
        query_type,
        QueryType::CodeGeneration | QueryType::Architecture | QueryType::Planning
    ) && complexity >= QueryComplexity::Moderate
    {
        recommended = recommended.max(Tier::Cloud);
    }

    // Policy check before any option is read, on the actual recommendation:
    // local destinations (cache included) are always permitted, anything
    // remote is subject to classification, paranoid, and offline pinning.
    let enforcement =
        enforcement::enforce(classification, recommended, opts.offline, opts.paranoid);
    if let Some(denial) = enforcement.denial {
        debug!(%classification, reason = %denial, "routing pinned to local");
        return local_decision(
            complexity,
            query_type,
            format!("{complexity:?} complexity ({query_type:?}) -> Local tier (FORCED: {denial})"),
        );
    }
    let recommended = enforcement.tier;

    // Mode handling. A remote recommendation without a credential degrades
    // to Local rather than failing.
    let mut reason_suffix = String::new();
    let tier = match opts.mode {
        RoutingMode::Local => {
            reason_suffix.push_str(" (mode=local)");
            recommended.min(Tier::Local)
        }
        RoutingMode::Cloud | RoutingMode::Auto | RoutingMode::Hybrid => {
            if recommended.is_local() {
                recommended
            } else if opts.has_cloud_key {
                recommended
            } else {
                reason_suffix.push_str(" (no cloud credential)");
                Tier::Local
            }
        }
    };

    // Cost cap, applied last — it can only lower the tier.
    let tier = match opts.max_tier {
        Some(cap) if tier > cap => {
            reason_suffix.push_str(" (capped by max_tier)");
            cap
        }
        _ => tier,
    };

    let input_estimate = estimate_tokens(query);
    let estimated_cost_cents = tier.cost_cents(input_estimate, input_estimate * 3);

    let is_auto_routed = !tier.is_local()
        && matches!(opts.mode, RoutingMode::Auto | RoutingMode::Hybrid);

    RoutingDecision {
        tier,
        complexity,
        query_type,
        estimated_cost_cents,
        reason: format!(
            "{complexity:?} complexity ({query_type:?}) -> {} tier{reason_suffix}",
            tier.name()
        ),
        selected_model: tier
            .is_local()
            .then(|| query_type.model_hint().to_string()),
        is_auto_routed,
    }
}

fn local_decision(
    complexity: QueryComplexity,
    query_type: QueryType,
    reason: String,
) -> RoutingDecision {
    RoutingDecision {
        tier: Tier::Local,
        complexity,
        query_type,
        estimated_cost_cents: 0.0,
        reason,
        selected_model: Some(query_type.model_hint().to_string()),
        is_auto_routed: false,
    }
}
