//! Bias estimation seam.
//!
//! The compliance gate treats bias scoring as an external capability behind
//! [`BiasEstimator`]. [`LexiconBiasEstimator`] is the deterministic default:
//! it counts generalising phrases per [`BiasCategory`] and scores each
//! category at `0.15` per hit, capped at `1.0`. The overall score is the
//! highest category score.

use std::collections::BTreeMap;

use async_trait::async_trait;
use mothership_types::{BiasAssessment, BiasCategory, BiasSeverity, MothershipError};

/// Scores a piece of text for bias. Implementations may call out to a model.
#[async_trait]
pub trait BiasEstimator: Send + Sync {
    async fn estimate(&self, text: &str) -> Result<BiasAssessment, MothershipError>;
}

const HIT_WEIGHT: f32 = 0.15;

/// Phrase lexicon per category. Matching is case-insensitive on
/// whitespace-normalised text.
fn lexicon(category: BiasCategory) -> &'static [&'static str] {
    match category {
        BiasCategory::Gender => &[
            "women are naturally",
            "men are naturally",
            "women can't",
            "men don't cry",
            "like a girl",
            "girls are bad at",
            "boys are better at",
        ],
        BiasCategory::Racial => &[
            "those people",
            "people of that race",
            "racially inferior",
            "all immigrants are",
        ],
        BiasCategory::Cultural => &[
            "primitive culture",
            "uncivilized",
            "normal people eat",
            "foreigners always",
        ],
        BiasCategory::Religious => &[
            "godless",
            "all muslims are",
            "all christians are",
            "all jews are",
            "heathens",
        ],
        BiasCategory::Socioeconomic => &[
            "poor people are lazy",
            "welfare queens",
            "trailer trash",
            "only rich people",
        ],
        BiasCategory::Accessibility => &[
            "just look at the screen",
            "anyone can simply click",
            "obviously visible",
        ],
        BiasCategory::Age => &[
            "too old to learn",
            "ok boomer",
            "millennials are lazy",
            "old people can't",
        ],
        BiasCategory::Disability => &[
            "suffers from",
            "confined to a wheelchair",
            "retarded",
            "crippled by",
            "normal people",
        ],
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LexiconBiasEstimator;

impl LexiconBiasEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous scoring used by the async trait method.
    pub fn assess(&self, text: &str) -> BiasAssessment {
        let normalised = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let mut categories = BTreeMap::new();
        for category in BiasCategory::ALL {
            let hits = lexicon(category)
                .iter()
                .map(|phrase| normalised.matches(phrase).count())
                .sum::<usize>();
            if hits > 0 {
                categories.insert(category, (hits as f32 * HIT_WEIGHT).min(1.0));
            }
        }
        let score = categories.values().copied().fold(0.0f32, f32::max);
        BiasAssessment {
            score,
            severity: BiasSeverity::from_score(score),
            categories,
        }
    }
}

#[async_trait]
impl BiasEstimator for LexiconBiasEstimator {
    async fn estimate(&self, text: &str) -> Result<BiasAssessment, MothershipError> {
        Ok(self.assess(text))
    }
}
