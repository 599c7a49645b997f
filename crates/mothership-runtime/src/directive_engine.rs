//! [`DirectiveGenerator`] – turns knowledge into task-specific constraints.
//!
//! # Algorithm
//!
//! 1. Fingerprint `(task_type, context)`; reuse a cached unexpired directive.
//! 2. Embed `"{task_type}: {context}"`.
//! 3. Similarity-search the knowledge base for the `top_k` nearest Values and
//!    Beliefs and keep those at or above `min_similarity`.
//! 4. No survivors ⇒ [`MothershipError::NoApplicableKnowledge`]. An empty
//!    directive would pass the compliance gate vacuously.
//! 5. Merge each match's guidance in rank order; a key is only filled by the
//!    first match that provides it. Entries without guidance contribute a
//!    `guideline` keyed `value:<name>` / `belief:<name>`.
//! 6. Record the source ids, persist the directive and retain its sources in
//!    the knowledge base so they cannot be deleted underneath it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mothership_memory::Ledger;
use mothership_memory::ontology::{KnowledgeBase, KnowledgeEntry, KnowledgeMatch};
use mothership_types::{
    BeliefId, Constraint, ConstraintSet, Directive, DirectiveId, EntityKind, MothershipError,
    ValueId,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::providers::EmbeddingProvider;

#[derive(Debug, Clone)]
pub struct DirectiveConfig {
    /// Number of nearest entries considered.
    pub top_k: usize,
    /// Matches below this cosine similarity are discarded.
    pub min_similarity: f32,
    /// Lifetime of a directive; `None` means it never expires.
    pub horizon: Option<Duration>,
}

impl Default for DirectiveConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.1,
            horizon: Some(Duration::hours(24)),
        }
    }
}

/// Stable fingerprint of a `(task_type, context)` pair: hex SHA-256 of the
/// trimmed task type and the whitespace-collapsed, lowercased context.
pub fn fingerprint(task_type: &str, context: &str) -> String {
    let context = context.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(task_type.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(context.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constraints and source ids derived from ranked matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub constraints: ConstraintSet,
    pub source_values: BTreeSet<ValueId>,
    pub source_beliefs: BTreeSet<BeliefId>,
}

/// Deterministic first-match-wins merge of `matches` (already ranked).
pub fn synthesize(matches: &[KnowledgeMatch]) -> Synthesis {
    let mut constraints = ConstraintSet::new();
    let mut source_values = BTreeSet::new();
    let mut source_beliefs = BTreeSet::new();

    for hit in matches {
        let prefix = match &hit.entry {
            KnowledgeEntry::Value(v) => {
                source_values.insert(v.id);
                "value"
            }
            KnowledgeEntry::Belief(b) => {
                source_beliefs.insert(b.id);
                source_values.extend(b.related_values.iter().copied());
                "belief"
            }
        };
        if hit.guidance().is_empty() {
            constraints.fill(
                &format!("{prefix}:{}", hit.name()),
                &Constraint::Guideline {
                    text: hit.description().to_string(),
                },
            );
        } else {
            for (key, constraint) in hit.guidance().iter() {
                constraints.fill(key, constraint);
            }
        }
    }

    Synthesis {
        constraints,
        source_values,
        source_beliefs,
    }
}

pub struct DirectiveGenerator {
    kb: Arc<KnowledgeBase>,
    ledger: Arc<Ledger>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: DirectiveConfig,
    /// fingerprint → most recent directive for it
    cache: Mutex<HashMap<String, Directive>>,
}

impl DirectiveGenerator {
    /// Build a generator and warm its cache from persisted directives.
    pub fn new(
        kb: Arc<KnowledgeBase>,
        ledger: Arc<Ledger>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: DirectiveConfig,
    ) -> Result<Self, MothershipError> {
        let now = Utc::now();
        let cache = ledger
            .load_directives()?
            .into_iter()
            .filter(|d| !d.is_expired(now))
            .map(|d| (d.fingerprint.clone(), d))
            .collect::<HashMap<_, _>>();
        debug!(cached = cache.len(), "directive cache warmed");
        Ok(Self {
            kb,
            ledger,
            embedder,
            config,
            cache: Mutex::new(cache),
        })
    }

    pub fn config(&self) -> &DirectiveConfig {
        &self.config
    }

    pub async fn generate(&self, task_type: &str, context: &str) -> Result<Directive, MothershipError> {
        self.generate_at(task_type, context, Utc::now()).await
    }

    /// [`generate`](Self::generate) with an explicit clock.
    pub async fn generate_at(
        &self,
        task_type: &str,
        context: &str,
        now: DateTime<Utc>,
    ) -> Result<Directive, MothershipError> {
        if task_type.trim().is_empty() {
            return Err(MothershipError::Validation("task_type must not be blank".into()));
        }
        let fp = fingerprint(task_type, context);
        if let Some(cached) = self.cached(&fp, now) {
            debug!(directive_id = %cached.id, fingerprint = %fp, "reusing cached directive");
            return Ok(cached);
        }

        let query = self.embedder.embed(&format!("{task_type}: {context}")).await?;
        let matches: Vec<KnowledgeMatch> = self
            .kb
            .similarity_search(&query, self.config.top_k)?
            .into_iter()
            .filter(|m| m.similarity >= self.config.min_similarity)
            .collect();
        if matches.is_empty() {
            info!(task_type, "no knowledge above similarity threshold");
            return Err(MothershipError::NoApplicableKnowledge {
                task_type: task_type.to_string(),
            });
        }

        let Synthesis {
            constraints,
            source_values,
            source_beliefs,
        } = synthesize(&matches);
        let directive = Directive {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            fingerprint: fp.clone(),
            constraints,
            source_values,
            source_beliefs,
            created_at: now,
            expires_at: self.config.horizon.map(|h| now + h),
        };

        self.ledger.save_directive(&directive)?;
        self.kb
            .retain_for_directive(directive.id, &directive.source_values, &directive.source_beliefs)?;
        {
            let mut cache = self.cache.lock();
            let before = cache.len();
            cache.retain(|_, d| !d.is_expired(now));
            if cache.len() != before {
                debug!(evicted = before - cache.len(), "expired directives evicted from cache");
            }
            cache.insert(fp, directive.clone());
        }

        info!(
            directive_id = %directive.id,
            task_type,
            constraints = directive.constraints.len(),
            matches = matches.len(),
            "directive generated"
        );
        Ok(directive)
    }

    fn cached(&self, fp: &str, now: DateTime<Utc>) -> Option<Directive> {
        let mut cache = self.cache.lock();
        match cache.get(fp) {
            Some(d) if !d.is_expired(now) => Some(d.clone()),
            Some(_) => {
                cache.remove(fp);
                None
            }
            None => None,
        }
    }

    /// Number of cached fingerprints.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn get(&self, id: DirectiveId) -> Result<Directive, MothershipError> {
        self.ledger
            .get_directive(id)?
            .ok_or(MothershipError::NotFound {
                kind: EntityKind::Directive,
                id,
            })
    }
}
