//! [`KnowledgeCurator`] – embedding-aware writes to the knowledge base.
//!
//! Callers supply names and descriptions; the curator embeds
//! `"{name}: {description}"` through the configured [`EmbeddingProvider`]
//! and stores the result. Description edits are re-embedded so similarity
//! search always reflects the current text.

use std::collections::BTreeSet;
use std::sync::Arc;

use mothership_memory::ontology::{
    BeliefUpdate, KnowledgeBase, NewBelief, NewValue, ValueUpdate,
};
use mothership_types::{Belief, BeliefId, ConstraintSet, MothershipError, Value, ValueId};
use serde::Deserialize;
use tracing::debug;

use crate::providers::EmbeddingProvider;

/// Request for [`KnowledgeCurator::edit_value`] / [`KnowledgeCurator::edit_belief`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KnowledgeEdit {
    pub description: Option<String>,
    pub guidance: Option<ConstraintSet>,
    /// Beliefs only; ignored for Values.
    pub related_values: Option<BTreeSet<ValueId>>,
}

pub struct KnowledgeCurator {
    kb: Arc<KnowledgeBase>,
    embedder: Arc<dyn EmbeddingProvider>,
}

fn embedding_text(name: &str, description: &str) -> String {
    format!("{name}: {description}")
}

impl KnowledgeCurator {
    pub fn new(kb: Arc<KnowledgeBase>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { kb, embedder }
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    async fn embed(&self, name: &str, description: &str) -> Result<Vec<f32>, MothershipError> {
        let embedding = self.embedder.embed(&embedding_text(name, description)).await?;
        debug!(name, dims = embedding.len(), "knowledge entry embedded");
        Ok(embedding)
    }

    pub async fn add_value(
        &self,
        name: &str,
        description: &str,
        guidance: ConstraintSet,
    ) -> Result<Value, MothershipError> {
        if name.trim().is_empty() {
            return Err(MothershipError::Validation("value name must not be blank".into()));
        }
        let embedding = self.embed(name, description).await?;
        let value = self
            .kb
            .put_value(NewValue::new(name, description, embedding).with_guidance(guidance))?;
        Ok(value)
    }

    pub async fn add_belief(
        &self,
        name: &str,
        description: &str,
        related_values: BTreeSet<ValueId>,
        guidance: ConstraintSet,
    ) -> Result<Belief, MothershipError> {
        if name.trim().is_empty() {
            return Err(MothershipError::Validation("belief name must not be blank".into()));
        }
        let embedding = self.embed(name, description).await?;
        let mut new = NewBelief::new(name, description, embedding).with_guidance(guidance);
        new.related_values = related_values;
        Ok(self.kb.put_belief(new)?)
    }

    pub async fn edit_value(&self, id: ValueId, edit: KnowledgeEdit) -> Result<Value, MothershipError> {
        let current = self.kb.get_value(id)?;
        let embedding = match &edit.description {
            Some(description) => Some(self.embed(&current.name, description).await?),
            None => None,
        };
        Ok(self.kb.update_value(
            id,
            ValueUpdate {
                description: edit.description,
                embedding,
                guidance: edit.guidance,
            },
        )?)
    }

    pub async fn edit_belief(
        &self,
        id: BeliefId,
        edit: KnowledgeEdit,
    ) -> Result<Belief, MothershipError> {
        let current = self.kb.get_belief(id)?;
        let embedding = match &edit.description {
            Some(description) => Some(self.embed(&current.name, description).await?),
            None => None,
        };
        Ok(self.kb.update_belief(
            id,
            BeliefUpdate {
                description: edit.description,
                embedding,
                related_values: edit.related_values,
                guidance: edit.guidance,
            },
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::HashingEmbedder;

    fn curator() -> KnowledgeCurator {
        KnowledgeCurator::new(
            Arc::new(KnowledgeBase::open_in_memory().unwrap()),
            Arc::new(HashingEmbedder::default()),
        )
    }

    #[tokio::test]
    async fn add_value_embeds_name_and_description() -> Result<(), Box<dyn std::error::Error>> {
        let c = curator();
        let v = c.add_value("Fairness", "Treat every learner equally", ConstraintSet::new()).await?;
        let expected = HashingEmbedder::default().embed_sync("Fairness: Treat every learner equally");
        assert_eq!(v.embedding, expected);
        Ok(())
    }

    #[tokio::test]
    async fn belief_with_unknown_value_is_rejected() {
        let c = curator();
        let err = c
            .add_belief(
                "Clear Explanations",
                "Explain each step",
                BTreeSet::from([uuid::Uuid::new_v4()]),
                ConstraintSet::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_reference");
        assert_eq!(c.knowledge_base().summary().unwrap().total_beliefs, 0);
    }

    #[tokio::test]
    async fn description_edit_reembeds() -> Result<(), Box<dyn std::error::Error>> {
        let c = curator();
        let v = c.add_value("Fairness", "old text", ConstraintSet::new()).await?;
        let edited = c
            .edit_value(
                v.id,
                KnowledgeEdit {
                    description: Some("brand new wording".into()),
                    ..KnowledgeEdit::default()
                },
            )
            .await?;
        assert_eq!(edited.description, "brand new wording");
        assert_ne!(edited.embedding, v.embedding);
        assert_eq!(edited.id, v.id);
        Ok(())
    }

    #[tokio::test]
    async fn blank_name_is_a_validation_error() {
        let err = curator()
            .add_value("  ", "x", ConstraintSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
