//! Ontology seeding from a TOML file.
//!
//! ```toml
//! [[values]]
//! name = "Privacy"
//! description = "Never reveal credentials or personal data"
//! [values.guidance.privacy]
//! kind = "forbidden_topic"
//! keywords = ["password", "secret"]
//!
//! [[beliefs]]
//! name = "Clear Explanations"
//! description = "Show each step of the reasoning"
//! related_values = ["Privacy"]
//! ```
//!
//! Beliefs name their related values; names are resolved against the
//! knowledge base after every value in the file has been written. Entries
//! whose name already exists are skipped, so seeding is repeatable.

use std::collections::{BTreeMap, BTreeSet};

use mothership_runtime::KnowledgeCurator;
use mothership_types::{Constraint, ConstraintSet, EntityKind, MothershipError, ValueId};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedFile {
    pub values: Vec<SeedValue>,
    pub beliefs: Vec<SeedBelief>,
}

#[derive(Debug, Deserialize)]
pub struct SeedValue {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub guidance: BTreeMap<String, Constraint>,
}

#[derive(Debug, Deserialize)]
pub struct SeedBelief {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub related_values: Vec<String>,
    #[serde(default)]
    pub guidance: BTreeMap<String, Constraint>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub values_added: usize,
    pub beliefs_added: usize,
    pub skipped: usize,
}

impl SeedFile {
    pub fn parse(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| format!("Failed to parse seed file: {}", e))
    }
}

fn guidance(entries: &BTreeMap<String, Constraint>) -> ConstraintSet {
    entries
        .iter()
        .fold(ConstraintSet::new(), |set, (key, c)| set.with(key.as_str(), c.clone()))
}

/// Write every entry of `file` through `curator`.
pub async fn apply(curator: &KnowledgeCurator, file: &SeedFile) -> Result<SeedReport, MothershipError> {
    let kb = curator.knowledge_base();
    let mut report = SeedReport::default();

    for value in &file.values {
        if kb.find_value(&value.name)?.is_some() {
            report.skipped += 1;
            continue;
        }
        curator
            .add_value(&value.name, &value.description, guidance(&value.guidance))
            .await?;
        report.values_added += 1;
    }

    for belief in &file.beliefs {
        let mut related: BTreeSet<ValueId> = BTreeSet::new();
        for name in &belief.related_values {
            let value = kb.find_value(name)?.ok_or_else(|| {
                MothershipError::Validation(format!(
                    "belief '{}' relates to unknown value '{}'",
                    belief.name, name
                ))
            })?;
            related.insert(value.id);
        }
        match curator
            .add_belief(&belief.name, &belief.description, related, guidance(&belief.guidance))
            .await
        {
            Ok(_) => report.beliefs_added += 1,
            Err(MothershipError::DuplicateName {
                kind: EntityKind::Belief,
                ..
            }) => report.skipped += 1,
            Err(e) => return Err(e),
        }
    }

    info!(
        values = report.values_added,
        beliefs = report.beliefs_added,
        skipped = report.skipped,
        "ontology seeded"
    );
    Ok(report)
}
