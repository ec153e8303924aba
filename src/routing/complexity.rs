//! Keyword-driven query grading.
//!
//! Two independent classifiers run over the raw query text:
//!
//! - [`QueryComplexity`] grades how hard the response is to produce and maps
//!   to the minimum tier able to answer it.
//! - [`QueryType`] buckets the intent and yields a model-selection hint.
//!
//! Both are deliberately cheap string heuristics — they run on every request
//! before any network call, so an embedding-based classifier would dominate
//! routing latency for no routing benefit.

use serde::{Deserialize, Serialize};

use super::tier::Tier;

/// Coarse complexity grade of a query.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    /// Greeting or pattern match — cache or local.
    Trivial,
    /// Basic lookup, single-step reasoning — local.
    Simple,
    /// Multi-step reasoning, context needed.
    Moderate,
    /// Analysis, synthesis, anything code-shaped.
    Complex,
    /// Architectural decisions, trade-off analysis.
    Expert,
}

impl QueryComplexity {
    /// Minimum tier recommended for this grade.
    ///
    /// Trivial stays in the cache, Simple stays on the local daemon, and
    /// everything above goes to the aggregate remote tier where the
    /// gateway's auto-router picks the concrete model.
    pub fn min_tier(&self) -> Tier {
        match self {
            Self::Trivial => Tier::Cache,
            Self::Simple => Tier::Local,
            Self::Moderate | Self::Complex | Self::Expert => Tier::Cloud,
        }
    }
}

impl std::fmt::Display for QueryComplexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Trivial => "Trivial",
            Self::Simple => "Simple",
            Self::Moderate => "Moderate",
            Self::Complex => "Complex",
            Self::Expert => "Expert",
        })
    }
}

/// Classify query complexity from text heuristics.
///
/// Thresholds are set low on purpose: local models only keep the very simple
/// queries, and anything substantial goes remote where the auto-router finds
/// the cheapest capable model.
pub fn classify_complexity(query: &str) -> QueryComplexity {
    let q = query.to_lowercase();
    let word_count = query.split_whitespace().count();

    // Expert indicators: architectural decisions and trade-offs.
    if q.contains("architect")
        || q.contains("design pattern")
        || q.contains("trade-off")
        || q.contains("best approach")
        || q.contains("should i")
        || q.contains("pros and cons")
    {
        return QueryComplexity::Expert;
    }

    // Complex indicators: analysis or anything code-related, or 15+ words.
    if q.contains("explain")
        || q.contains("compare")
        || q.contains("analyze")
        || q.contains("implement")
        || q.contains("refactor")
        || q.contains("review")
        || q.contains("code")
        || q.contains("function")
        || q.contains("bug")
        || q.contains("error")
        || word_count > 15
    {
        return QueryComplexity::Complex;
    }

    // Moderate indicators: how/why questions, debugging, or 10+ words.
    if q.contains("how")
        || q.contains("why")
        || q.contains("debug")
        || q.contains("fix")
        || word_count > 10
    {
        return QueryComplexity::Moderate;
    }

    // Simple: basic lookups.
    if q.contains("what is") || q.contains("where is") || q.contains("find") || q.contains("list") {
        return QueryComplexity::Simple;
    }

    if word_count >= 5 {
        return QueryComplexity::Moderate;
    }

    QueryComplexity::Trivial
}

/// Intent bucket of a query, used as a model-selection hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Simple fact lookup ("what is X").
    Lookup,
    /// How/why explanations.
    Explanation,
    /// Write new code.
    CodeGeneration,
    /// Modify existing code.
    Refactoring,
    /// Design decisions.
    Architecture,
    /// Find and fix bugs.
    Debugging,
    /// Code review.
    Review,
    /// Project planning.
    Planning,
    /// General conversation.
    General,
    /// Could not be classified.
    Unknown,
}

impl QueryType {
    /// Classify intent with keyword matching, first match wins.
    pub fn classify(query: &str) -> Self {
        let q = query.to_lowercase();
        if q.trim().is_empty() {
            return Self::Unknown;
        }

        if q.contains("what is") || q.contains("syntax") || q.starts_with("list ") || q.contains("first ")
        {
            return Self::Lookup;
        }
        if q.contains("explain") || q.contains("how does") || q.contains("why ") {
            return Self::Explanation;
        }
        if q.contains("write") || q.contains("create") || q.contains("implement") || q.contains("generate")
        {
            return Self::CodeGeneration;
        }
        if q.contains("refactor") || q.contains("improve") || q.contains("optimize") {
            return Self::Refactoring;
        }
        if q.contains("architect") || q.contains("design") || q.contains("should i") || q.contains("trade-off")
        {
            return Self::Architecture;
        }
        if q.contains("bug") || q.contains("fix") || q.contains("debug") || q.contains("error") {
            return Self::Debugging;
        }
        if q.contains("review") || q.contains("check") {
            return Self::Review;
        }
        if q.contains("plan") || q.contains("roadmap") {
            return Self::Planning;
        }
        Self::General
    }

    /// Model-capability hint for local model selection.
    pub fn model_hint(&self) -> &'static str {
        match self {
            Self::Lookup | Self::General | Self::Explanation | Self::Unknown => "fast",
            Self::CodeGeneration | Self::Refactoring | Self::Debugging => "code",
            Self::Architecture | Self::Planning | Self::Review => "reasoning",
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Lookup => "Lookup",
            Self::Explanation => "Explanation",
            Self::CodeGeneration => "CodeGeneration",
            Self::Refactoring => "Refactoring",
            Self::Architecture => "Architecture",
            Self::Debugging => "Debugging",
            Self::Review => "Review",
            Self::Planning => "Planning",
            Self::General => "General",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}
