//! [`ComplianceGate`] – classification of agent output before it is accepted.
//!
//! [`ComplianceGate::evaluate`] runs three independent checks:
//!
//! 1. **Constraint satisfaction** ([`constraint_check`]): every entry of the
//!    directive's constraint set is tested; each failure is recorded as a
//!    [`ConstraintViolation`](mothership_types::ConstraintViolation) and
//!    `compliance_score = max(0, 1 − violated / total)`.
//! 2. **Bias estimation** ([`BiasEstimator`]): pluggable; its overall score
//!    becomes `bias_score`.
//! 3. **Review rules** ([`OutputVerifier`]): crisis patterns and any custom
//!    [`OutputRule`]s. Always run.
//!
//! `requires_human_review` is set when the compliance score is below
//! `review_threshold`, the bias score is above `bias_threshold`, any review
//! rule fires, or the bias estimator could not be reached.
//!
//! The gate never mutates the directive or the output and never fails:
//! findings are data.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use mothership_kernel::{ComplianceGate, GateConfig, LexiconBiasEstimator};
//!
//! let config = GateConfig { review_threshold: 0.8, ..GateConfig::default() };
//! let gate = ComplianceGate::new(config, Arc::new(LexiconBiasEstimator::new())).unwrap();
//! ```

use std::sync::Arc;

use mothership_types::{BiasAssessment, ComplianceReport, Directive, MothershipError};
use tracing::{debug, info, warn};

use crate::bias::BiasEstimator;
use crate::constraint_check::{self, AgentOutput};
use crate::output_rules::{CrisisPatternRule, OutputRule, OutputVerifier};

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Compliance scores strictly below this flag the output for review.
    pub review_threshold: f32,
    /// Bias scores strictly above this flag the output for review.
    pub bias_threshold: f32,
    /// Case-insensitive regular expressions that always force review.
    pub crisis_patterns: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.7,
            bias_threshold: 0.5,
            crisis_patterns: CrisisPatternRule::DEFAULT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Scores agent output against the directive it was produced under.
pub struct ComplianceGate {
    review_threshold: f32,
    bias_threshold: f32,
    verifier: OutputVerifier,
    bias: Arc<dyn BiasEstimator>,
}

impl ComplianceGate {
    /// Build a gate, compiling the configured crisis patterns.
    pub fn new(config: GateConfig, bias: Arc<dyn BiasEstimator>) -> Result<Self, MothershipError> {
        let crisis = CrisisPatternRule::new(&config.crisis_patterns)
            .map_err(|e| MothershipError::Validation(format!("crisis pattern: {e}")))?;
        let mut verifier = OutputVerifier::new();
        verifier.add_rule(Box::new(crisis));
        Ok(Self {
            review_threshold: config.review_threshold,
            bias_threshold: config.bias_threshold,
            verifier,
            bias,
        })
    }

    /// Register an additional review trigger.
    pub fn add_rule(&mut self, rule: Box<dyn OutputRule>) {
        self.verifier.add_rule(rule);
    }

    /// Classify `output` against `directive`.
    pub async fn evaluate(
        &self,
        directive: &Directive,
        output: &serde_json::Value,
    ) -> ComplianceReport {
        let view = AgentOutput::new(output);

        let violations = constraint_check::check_all(&directive.constraints, &view);
        let compliance_score =
            constraint_check::compliance_score(violations.len(), directive.constraints.len());

        let (bias, estimator_failed) = match self.bias.estimate(view.text()).await {
            Ok(assessment) => (assessment, false),
            Err(e) => {
                warn!(directive_id = %directive.id, error = %e, "bias estimator unavailable; flagging for review");
                (BiasAssessment::clean(), true)
            }
        };
        let bias_score = bias.score.clamp(0.0, 1.0);

        let crisis_matches = self.verifier.verify(&view);

        let requires_human_review = compliance_score < self.review_threshold
            || bias_score > self.bias_threshold
            || !crisis_matches.is_empty()
            || estimator_failed;

        if requires_human_review {
            info!(
                directive_id = %directive.id,
                compliance_score,
                bias_score,
                violations = violations.len(),
                crisis = crisis_matches.len(),
                "output flagged for human review"
            );
        } else {
            debug!(directive_id = %directive.id, compliance_score, bias_score, "output passed gate");
        }

        ComplianceReport {
            compliance_score,
            bias_score,
            requires_human_review,
            violations,
            bias,
            crisis_matches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bias::LexiconBiasEstimator;
    use async_trait::async_trait;
    use chrono::Utc;
    use mothership_types::{Constraint, ConstraintKind, ConstraintSet};
    use serde_json::json;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn directive(constraints: ConstraintSet) -> Directive {
        Directive {
            id: Uuid::new_v4(),
            task_type: "math".to_string(),
            fingerprint: "fp".to_string(),
            constraints,
            source_values: BTreeSet::new(),
            source_beliefs: BTreeSet::new(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    fn gate() -> ComplianceGate {
        ComplianceGate::new(GateConfig::default(), Arc::new(LexiconBiasEstimator::new())).unwrap()
    }

    fn four_constraints() -> ConstraintSet {
        ConstraintSet::new()
            .with(
                "privacy",
                Constraint::ForbiddenTopic {
                    keywords: vec!["password".to_string(), "secret".to_string()],
                },
            )
            .with(
                "status",
                Constraint::RequiredDisclosure {
                    field: "status".to_string(),
                },
            )
            .with("length", Constraint::MaxLength { max_chars: 40 })
            .with(
                "clarity",
                Constraint::Guideline {
                    text: "Explain each step".to_string(),
                },
            )
    }

    #[tokio::test]
    async fn clean_output_scores_one() {
        let d = directive(four_constraints());
        let r = gate()
            .evaluate(&d, &json!({"result": "x=2", "status": "done"}))
            .await;
        assert_eq!(r.compliance_score, 1.0);
        assert!(r.violations.is_empty());
        assert!(!r.requires_human_review);
    }

    #[tokio::test]
    async fn score_drops_with_each_violation() {
        let d = directive(four_constraints());
        let g = gate();

        let one = g.evaluate(&d, &json!({"result": "x=2"})).await;
        assert_eq!(one.violations.len(), 1);
        assert_eq!(one.violations[0].kind, ConstraintKind::RequiredDisclosure);
        assert!((one.compliance_score - 0.75).abs() < 1e-6);

        let three = g
            .evaluate(
                &d,
                &json!({"result": "the secret password is swordfish, do not share it with anyone"}),
            )
            .await;
        assert_eq!(three.violations.len(), 3);
        assert!((three.compliance_score - 0.25).abs() < 1e-6);
        assert!(three.compliance_score < one.compliance_score);
        assert!(three.requires_human_review);
    }

    #[tokio::test]
    async fn all_violated_scores_zero() {
        let set = ConstraintSet::new()
            .with(
                "status",
                Constraint::RequiredDisclosure {
                    field: "status".to_string(),
                },
            )
            .with("length", Constraint::MaxLength { max_chars: 1 });
        let r = gate().evaluate(&directive(set), &json!("too long")).await;
        assert_eq!(r.compliance_score, 0.0);
    }

    #[tokio::test]
    async fn crisis_pattern_forces_review_with_full_compliance() {
        let set = ConstraintSet::new().with(
            "clarity",
            Constraint::Guideline {
                text: "be kind".to_string(),
            },
        );
        let r = gate()
            .evaluate(&directive(set), &json!({"result": "please call the suicide hotline"}))
            .await;
        assert_eq!(r.compliance_score, 1.0);
        assert!(r.requires_human_review);
        assert_eq!(r.crisis_matches.len(), 1);
    }

    #[tokio::test]
    async fn high_bias_forces_review() {
        let set = ConstraintSet::new().with(
            "clarity",
            Constraint::Guideline {
                text: "be kind".to_string(),
            },
        );
        let text = "girls are bad at math; girls are bad at logic; girls are bad at code; girls are bad at chess";
        let r = gate().evaluate(&directive(set), &json!(text)).await;
        assert!(r.bias_score > 0.5);
        assert!(r.requires_human_review);
    }

    #[tokio::test]
    async fn estimator_failure_flags_review() {
        struct Down;
        #[async_trait]
        impl BiasEstimator for Down {
            async fn estimate(&self, _: &str) -> Result<BiasAssessment, MothershipError> {
                Err(MothershipError::Provider("offline".to_string()))
            }
        }
        let g = ComplianceGate::new(GateConfig::default(), Arc::new(Down)).unwrap();
        let d = directive(ConstraintSet::new().with(
            "clarity",
            Constraint::Guideline {
                text: "be kind".to_string(),
            },
        ));
        let r = g.evaluate(&d, &json!("x=2")).await;
        assert_eq!(r.bias_score, 0.0);
        assert!(r.requires_human_review);
    }

    #[test]
    fn bad_crisis_pattern_is_a_config_error() {
        let config = GateConfig {
            crisis_patterns: vec!["[".to_string()],
            ..GateConfig::default()
        };
        let err = ComplianceGate::new(config, Arc::new(LexiconBiasEstimator::new()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn gate_does_not_mutate_inputs() {
        let d = directive(four_constraints());
        let before = d.clone();
        let output = json!({"result": "secret"});
        let output_before = output.clone();
        gate().evaluate(&d, &output).await;
        assert_eq!(d, before);
        assert_eq!(output, output_before);
    }
}
