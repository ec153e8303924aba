//! Inference tiers — the destinations a query can be routed to.
//!
//! Tiers form an ordered ladder from the free on-host options (`Cache`,
//! `Local`) through the aggregate remote tiers (`Auto`, `Cloud`) to the named
//! paid models. Each tier knows its price point, typical latency and its next
//! escalation step, so routing and cost accounting read off the same table.

use serde::{Deserialize, Serialize};

/// A named destination and price point for answering a query.
///
/// `Cloud` and `Auto` are both aggregate remote tiers (the gateway's
/// auto-router picks the concrete model); `Cloud` is the value the
/// classifier produces, `Auto` is accepted everywhere `Cloud` is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Hash-keyed response memo. Free, instant.
    Cache,
    /// On-host inference daemon. Free.
    #[default]
    Local,
    /// Aggregate remote tier, auto-routed model selection.
    Auto,
    /// Aggregate remote tier (canonical routing output).
    Cloud,
    Haiku,
    Sonnet,
    Opus,
    Gpt4o,
}

impl Tier {
    /// Human-readable tier name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cache => "Cache",
            Self::Local => "Local",
            Self::Auto => "Auto",
            Self::Cloud => "Cloud",
            Self::Haiku => "Haiku",
            Self::Sonnet => "Sonnet",
            Self::Opus => "Opus",
            Self::Gpt4o => "GPT-4o",
        }
    }

    /// Whether this tier stays on-host. Everything else sends data
    /// off-premise and is blocked for `Cui` and above.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Cache | Self::Local)
    }

    /// Whether queries to this tier cost money.
    pub fn is_paid(&self) -> bool {
        !self.is_local()
    }

    /// Cost per 1K input tokens, in cents.
    pub fn input_cost_per_1k(&self) -> f64 {
        match self {
            Self::Cache | Self::Local => 0.0,
            // Aggregate remote: the gateway auto-router averages out cheap.
            Self::Auto | Self::Cloud => 0.03,
            Self::Haiku => 0.025,
            Self::Sonnet => 0.3,
            Self::Opus => 1.5,
            Self::Gpt4o => 0.25,
        }
    }

    /// Cost per 1K output tokens, in cents.
    pub fn output_cost_per_1k(&self) -> f64 {
        match self {
            Self::Cache | Self::Local => 0.0,
            Self::Auto | Self::Cloud => 0.15,
            Self::Haiku => 0.125,
            Self::Sonnet => 1.5,
            Self::Opus => 7.5,
            Self::Gpt4o => 1.0,
        }
    }

    /// Total cost in cents for a request of the given token counts.
    pub fn cost_cents(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_cost_per_1k()
            + (output_tokens as f64 / 1000.0) * self.output_cost_per_1k()
    }

    /// Typical end-to-end latency in milliseconds, for estimates only.
    pub fn typical_latency_ms(&self) -> u32 {
        match self {
            Self::Cache => 1,
            Self::Local => 500,
            Self::Auto | Self::Cloud => 1000,
            Self::Haiku => 800,
            Self::Sonnet => 1500,
            Self::Opus => 3000,
            Self::Gpt4o => 1200,
        }
    }

    /// Next step up the escalation ladder, if any.
    ///
    /// The aggregate remote tiers have no next step — the gateway's
    /// auto-router already picks the best model. Callers must run any
    /// escalation result through the classification enforcer before use.
    pub fn next_tier(&self) -> Option<Tier> {
        match self {
            Self::Cache => Some(Self::Local),
            Self::Local => Some(Self::Cloud),
            Self::Auto | Self::Cloud => None,
            Self::Haiku => Some(Self::Sonnet),
            Self::Sonnet => Some(Self::Opus),
            Self::Opus => None,
            Self::Gpt4o => None,
        }
    }

    /// All tiers, in ladder order. Used by `GET /v1/models`.
    pub fn all() -> &'static [Tier] {
        &[
            Self::Cache,
            Self::Local,
            Self::Auto,
            Self::Cloud,
            Self::Haiku,
            Self::Sonnet,
            Self::Opus,
            Self::Gpt4o,
        ]
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
