//! Relationship detection between two nodes.
//!
//! Detection runs as an ordered pipeline of tiers, cheapest first:
//!
//! 1. **Lexical**: keyword patterns over title + description
//! 2. **Similarity**: an injected [`SimilarityProvider`] scores text overlap
//! 3. **Semantic**: an injected async [`SemanticClassifier`] names the type
//!
//! Each stage carries an acceptance threshold. A result whose confidence is
//! strictly above its stage's threshold ends the pipeline; otherwise the
//! next stage runs and the current result is kept as the fallback. A stage
//! that errors or times out is skipped in favour of the fallback.
//!
//! ## Example
//!
//! ```
//! use goalweave::core::{Node, RelationshipType};
//! use goalweave::orchestration::LexicalTier;
//!
//! let a = Node::task("a", "Fix login bug").unwrap();
//! let b = Node::task("b", "Write API docs").unwrap();
//! let detection = LexicalTier::default().classify(&a, &b);
//! assert_eq!(detection.relationship, RelationshipType::Independent);
//! ```

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DetectionConfig;
use crate::core::{Node, RelationshipType};
use crate::error::{Error, Result};
use crate::util::with_timeout;

/// Confidence returned when no evidence points anywhere.
pub const INCONCLUSIVE_CONFIDENCE: f64 = 0.5;

/// Confidence added per keyword hit on top of [`INCONCLUSIVE_CONFIDENCE`].
const KEYWORD_WEIGHT: f64 = 0.2;

/// Lexical confidence never exceeds this.
const LEXICAL_CEILING: f64 = 0.95;

/// Curated keyword sets per relationship type.
const KEYWORDS: &[(RelationshipType, &[&str])] = &[
    (
        RelationshipType::Enables,
        &[
            "requires",
            "required by",
            "depends on",
            "dependent on",
            "prerequisite",
            "blocked by",
            "unblocks",
            "enables",
            "needed for",
            "before",
            "after",
        ],
    ),
    (
        RelationshipType::SubgoalOf,
        &[
            "part of",
            "subtask",
            "sub-task",
            "component of",
            "milestone",
            "step toward",
            "phase of",
        ],
    ),
    (
        RelationshipType::ConflictsWith,
        &[
            "vs",
            "versus",
            "instead of",
            "conflicts with",
            "contradicts",
            "incompatible",
            "mutually exclusive",
            "rather than",
            "replaces",
        ],
    ),
    (
        RelationshipType::Synergistic,
        &[
            "together",
            "combine",
            "combined",
            "shared",
            "jointly",
            "along with",
            "synergy",
            "same codebase",
        ],
    ),
    (
        RelationshipType::Reinforces,
        &[
            "improves",
            "supports",
            "boosts",
            "strengthens",
            "reinforces",
            "complements",
            "amplifies",
        ],
    ),
];

static DEFAULT_PATTERNS: LazyLock<Vec<(RelationshipType, Vec<Regex>)>> = LazyLock::new(|| {
    KEYWORDS
        .iter()
        .map(|(rel, words)| {
            let patterns = words
                .iter()
                .map(|w| keyword_regex(w).expect("built-in keyword patterns are valid"))
                .collect();
            (*rel, patterns)
        })
        .collect()
});

fn keyword_regex(keyword: &str) -> Result<Regex> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(keyword.trim())))
        .map_err(|e| Error::Validation(format!("invalid keyword '{}': {}", keyword, e)))
}

/// Outcome of a detection tier or of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub relationship: RelationshipType,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Name of the tier that produced this result.
    pub tier: String,
}

impl Detection {
    pub fn new(relationship: RelationshipType, confidence: f64, tier: &str) -> Self {
        Self {
            relationship,
            confidence: confidence.clamp(0.0, 1.0),
            tier: tier.to_string(),
        }
    }

    /// Default answer when no tier produced anything.
    pub fn inconclusive() -> Self {
        Self::new(
            RelationshipType::Independent,
            INCONCLUSIVE_CONFIDENCE,
            "default",
        )
    }
}

/// One stage of the detection pipeline.
#[async_trait]
pub trait DetectionTier: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(&self, a: &Node, b: &Node, cancel: &CancellationToken) -> Result<Detection>;
}

/// Scores semantic similarity of two texts in `[0, 1]`.
#[async_trait]
pub trait SimilarityProvider: Send + Sync {
    async fn similarity(&self, a: &str, b: &str) -> Result<f64>;
}

/// Expensive judgment call (e.g. a language model) naming the relationship.
///
/// Implementations should stop work when `cancel` fires; the detector
/// cancels it once the per-call timeout expires.
#[async_trait]
pub trait SemanticClassifier: Send + Sync {
    async fn classify(
        &self,
        a: &Node,
        b: &Node,
        cancel: CancellationToken,
    ) -> Result<RelationshipType>;
}

/// Keyword matching over the concatenated text of both nodes.
#[derive(Debug, Clone)]
pub struct LexicalTier {
    patterns: Vec<(RelationshipType, Vec<Regex>)>,
}

impl Default for LexicalTier {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.clone(),
        }
    }
}

impl LexicalTier {
    pub const NAME: &'static str = "lexical";

    /// Add extra keywords for `relationship`.
    pub fn with_keywords(mut self, relationship: RelationshipType, keywords: &[&str]) -> Result<Self> {
        let extra = keywords
            .iter()
            .map(|k| keyword_regex(k))
            .collect::<Result<Vec<_>>>()?;
        match self.patterns.iter_mut().find(|(rel, _)| *rel == relationship) {
            Some((_, existing)) => existing.extend(extra),
            None => self.patterns.push((relationship, extra)),
        }
        Ok(self)
    }

    /// Synchronous classification. The type with the most keyword hits
    /// wins; ties go to the earlier entry in the keyword table.
    pub fn classify(&self, a: &Node, b: &Node) -> Detection {
        let text = format!("{} {}", a.text(), b.text());
        let mut best: Option<(RelationshipType, usize)> = None;

        for (relationship, patterns) in &self.patterns {
            let hits = patterns.iter().filter(|re| re.is_match(&text)).count();
            if hits == 0 {
                continue;
            }
            if best.map_or(true, |(_, top)| hits > top) {
                best = Some((*relationship, hits));
            }
        }

        match best {
            Some((relationship, hits)) => {
                let confidence =
                    (INCONCLUSIVE_CONFIDENCE + KEYWORD_WEIGHT * hits as f64).min(LEXICAL_CEILING);
                Detection::new(relationship, confidence, Self::NAME)
            }
            None => Detection::new(
                RelationshipType::Independent,
                INCONCLUSIVE_CONFIDENCE,
                Self::NAME,
            ),
        }
    }
}

#[async_trait]
impl DetectionTier for LexicalTier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn detect(&self, a: &Node, b: &Node, _cancel: &CancellationToken) -> Result<Detection> {
        Ok(self.classify(a, b))
    }
}

/// Similarity-based synergy detection.
pub struct SimilarityTier {
    provider: Arc<dyn SimilarityProvider>,
    synergy_threshold: f64,
}

impl SimilarityTier {
    pub const NAME: &'static str = "similarity";

    pub fn new(provider: Arc<dyn SimilarityProvider>, synergy_threshold: f64) -> Self {
        Self {
            provider,
            synergy_threshold,
        }
    }
}

#[async_trait]
impl DetectionTier for SimilarityTier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn detect(&self, a: &Node, b: &Node, _cancel: &CancellationToken) -> Result<Detection> {
        let raw = self.provider.similarity(&a.text(), &b.text()).await?;
        if !raw.is_finite() {
            return Err(Error::Detection(format!(
                "similarity provider returned {}",
                raw
            )));
        }
        let score = raw.clamp(0.0, 1.0);
        if score > self.synergy_threshold {
            Ok(Detection::new(RelationshipType::Synergistic, score, Self::NAME))
        } else {
            Ok(Detection::new(
                RelationshipType::Independent,
                1.0 - score,
                Self::NAME,
            ))
        }
    }
}

/// Delegates to a [`SemanticClassifier`] under a per-call timeout.
pub struct SemanticTier {
    classifier: Arc<dyn SemanticClassifier>,
    timeout: Duration,
    confidence: f64,
}

impl SemanticTier {
    pub const NAME: &'static str = "semantic";

    pub fn new(classifier: Arc<dyn SemanticClassifier>, timeout: Duration, confidence: f64) -> Self {
        Self {
            classifier,
            timeout,
            confidence,
        }
    }
}

#[async_trait]
impl DetectionTier for SemanticTier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn detect(&self, a: &Node, b: &Node, cancel: &CancellationToken) -> Result<Detection> {
        let scope = cancel.child_token();
        let call = with_timeout(self.timeout, self.classifier.classify(a, b, scope.clone()));

        let outcome = tokio::select! {
            outcome = call => outcome,
            _ = cancel.cancelled() => {
                scope.cancel();
                return Err(Error::Cancelled);
            }
        };

        match outcome {
            Ok(relationship) => Ok(Detection::new(relationship, self.confidence, Self::NAME)),
            Err(Error::Timeout(_)) => {
                scope.cancel();
                Err(Error::DetectionTimeout(self.timeout))
            }
            Err(e) => Err(e),
        }
    }
}

struct Stage {
    tier: Arc<dyn DetectionTier>,
    accept_above: f64,
}

/// Ordered detection pipeline.
pub struct RelationshipDetector {
    stages: Vec<Stage>,
}

impl Default for RelationshipDetector {
    fn default() -> Self {
        Self::from_config(&DetectionConfig::default(), None, None)
    }
}

impl RelationshipDetector {
    /// An empty pipeline; every call returns [`Detection::inconclusive`].
    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    /// Standard three-tier pipeline. Omitted collaborators drop their tier.
    pub fn from_config(
        config: &DetectionConfig,
        similarity: Option<Arc<dyn SimilarityProvider>>,
        classifier: Option<Arc<dyn SemanticClassifier>>,
    ) -> Self {
        let mut detector =
            Self::empty().with_stage(Arc::new(LexicalTier::default()), config.lexical_accept);
        if let Some(provider) = similarity {
            detector = detector.with_stage(
                Arc::new(SimilarityTier::new(provider, config.synergy_threshold)),
                config.similarity_accept,
            );
        }
        if let Some(classifier) = classifier {
            detector = detector.with_stage(
                Arc::new(SemanticTier::new(
                    classifier,
                    config.semantic_timeout(),
                    config.semantic_confidence,
                )),
                0.0,
            );
        }
        detector
    }

    /// Append a stage. Results with confidence strictly above
    /// `accept_above` stop the pipeline.
    pub fn with_stage(mut self, tier: Arc<dyn DetectionTier>, accept_above: f64) -> Self {
        self.stages.push(Stage { tier, accept_above });
        self
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.tier.name()).collect()
    }

    /// Classify the relationship between `a` and `b`.
    ///
    /// Only cancellation is surfaced as an error; tier failures and
    /// timeouts fall back to the best earlier result.
    pub async fn detect(&self, a: &Node, b: &Node, cancel: &CancellationToken) -> Result<Detection> {
        let mut fallback: Option<Detection> = None;

        for stage in &self.stages {
            let name = stage.tier.name();
            match stage.tier.detect(a, b, cancel).await {
                Ok(detection) => {
                    debug!(
                        tier = name,
                        a = %a.id(),
                        b = %b.id(),
                        relationship = %detection.relationship,
                        confidence = detection.confidence,
                        "tier result"
                    );
                    if detection.confidence > stage.accept_above {
                        return Ok(detection);
                    }
                    fallback = Some(detection);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(tier = name, a = %a.id(), b = %b.id(), error = %e, "detection tier failed, falling back");
                }
            }
        }

        Ok(fallback.unwrap_or_else(Detection::inconclusive))
    }
}
