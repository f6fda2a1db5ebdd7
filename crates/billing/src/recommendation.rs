//! Plan recommendation quiz
//!
//! Each answer option carries a weight; the summed score is mapped to a tier
//! through ascending thresholds. The quiz definition is product
//! configuration, published through the versioned [`ConfigStore`].

use std::collections::{HashMap, HashSet};

use nexo_shared::{ConfigStore, Tier, TypedConfig};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizConfig {
    pub questions: Vec<QuizQuestion>,
    /// Lowest score that earns each tier
    pub thresholds: Vec<TierThreshold>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub id: String,
    pub options: Vec<QuizOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizOption {
    pub id: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierThreshold {
    pub tier: Tier,
    pub min_score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recommendation {
    pub tier: Tier,
    pub score: u32,
}

impl TypedConfig for QuizConfig {
    const KEY: &'static str = "quiz";

    fn validate(&self) -> Result<(), String> {
        if self.questions.is_empty() {
            return Err("quiz has no questions".to_string());
        }
        let mut ids = HashSet::new();
        for question in &self.questions {
            if !ids.insert(question.id.as_str()) {
                return Err(format!("duplicate question id {}", question.id));
            }
            if question.options.is_empty() {
                return Err(format!("question {} has no options", question.id));
            }
        }
        if self.thresholds.is_empty() {
            return Err("quiz has no thresholds".to_string());
        }
        if !self
            .thresholds
            .windows(2)
            .all(|w| w[0].min_score < w[1].min_score && w[0].tier < w[1].tier)
        {
            return Err("thresholds must ascend in both score and tier".to_string());
        }
        Ok(())
    }
}

fn question(id: &str, weights: &[(&str, u32)]) -> QuizQuestion {
    QuizQuestion {
        id: id.to_string(),
        options: weights
            .iter()
            .map(|(option, weight)| QuizOption {
                id: option.to_string(),
                weight: *weight,
            })
            .collect(),
    }
}

impl Default for QuizConfig {
    fn default() -> Self {
        Self {
            questions: vec![
                question("experience", &[("none", 0), ("some", 1), ("professional", 2)]),
                question("goal", &[("explore", 0), ("one_course", 1), ("career", 3)]),
                question("time", &[("low", 0), ("medium", 1), ("high", 2)]),
                question("support", &[("self", 0), ("community", 1), ("mentoring", 3)]),
            ],
            thresholds: vec![
                TierThreshold {
                    tier: Tier::Starter,
                    min_score: 0,
                },
                TierThreshold {
                    tier: Tier::Pro,
                    min_score: 4,
                },
                TierThreshold {
                    tier: Tier::Operator,
                    min_score: 8,
                },
            ],
        }
    }
}

impl QuizConfig {
    /// Score `answers` (question id → option id). Every question must be
    /// answered with one of its options.
    pub fn recommend(&self, answers: &HashMap<String, String>) -> BillingResult<Recommendation> {
        let mut score = 0u32;
        for question in &self.questions {
            let answer = answers.get(&question.id).ok_or_else(|| {
                BillingError::InvalidInput(format!("missing answer for {}", question.id))
            })?;
            let option = question
                .options
                .iter()
                .find(|o| &o.id == answer)
                .ok_or_else(|| {
                    BillingError::InvalidInput(format!(
                        "unknown answer {} for {}",
                        answer, question.id
                    ))
                })?;
            score = score.saturating_add(option.weight);
        }

        let tier = self
            .thresholds
            .iter()
            .rev()
            .find(|t| score >= t.min_score)
            .map(|t| t.tier)
            .unwrap_or(Tier::Free);

        Ok(Recommendation { tier, score })
    }
}

/// Latest published quiz, or the built-in one when none is published or the
/// store is unavailable
pub async fn load_quiz_config(store: Option<&ConfigStore>) -> QuizConfig {
    let Some(store) = store else {
        return QuizConfig::default();
    };
    match store.latest::<QuizConfig>().await {
        Ok(Some(versioned)) => versioned.value,
        Ok(None) => QuizConfig::default(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load quiz config, using built-in quiz");
            QuizConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexo_shared::config_store::decode;

    fn answers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(q, a)| (q.to_string(), a.to_string()))
            .collect()
    }

    #[test]
    fn default_quiz_is_valid() {
        assert!(QuizConfig::default().validate().is_ok());
    }

    #[test]
    fn scores_map_to_tiers() {
        let quiz = QuizConfig::default();
        let low = quiz
            .recommend(&answers(&[
                ("experience", "none"),
                ("goal", "explore"),
                ("time", "low"),
                ("support", "self"),
            ]))
            .unwrap();
        assert_eq!(low, Recommendation { tier: Tier::Starter, score: 0 });

        let high = quiz
            .recommend(&answers(&[
                ("experience", "professional"),
                ("goal", "career"),
                ("time", "high"),
                ("support", "mentoring"),
            ]))
            .unwrap();
        assert_eq!(high.tier, Tier::Operator);
        assert_eq!(high.score, 10);
    }

    #[test]
    fn missing_or_unknown_answers_are_rejected() {
        let quiz = QuizConfig::default();
        assert!(matches!(
            quiz.recommend(&answers(&[("experience", "none")])),
            Err(BillingError::InvalidInput(_))
        ));
        assert!(matches!(
            quiz.recommend(&answers(&[
                ("experience", "wizard"),
                ("goal", "explore"),
                ("time", "low"),
                ("support", "self"),
            ])),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn stored_quiz_is_validated_on_decode() {
        let raw = serde_json::json!({
            "questions": [{"id": "q", "options": [{"id": "a", "weight": 1}]}],
            "thresholds": [
                {"tier": "PRO", "minScore": 0},
                {"tier": "STARTER", "minScore": 5}
            ]
        });
        assert!(decode::<QuizConfig>(3, raw).is_err());
    }

    #[tokio::test]
    async fn without_store_uses_built_in_quiz() {
        assert_eq!(load_quiz_config(None).await, QuizConfig::default());
    }
}
