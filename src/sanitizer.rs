//! Prompt-injection screening applied before every backend call.
//!
//! Scoring and rewriting live in an external collaborator behind
//! [`PromptSanitizer`]; this module only decides when to rewrite. It never
//! blocks a call.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    /// 0.0 (benign) to 1.0 (certain injection).
    pub risk_score: f64,
    pub detected_patterns: Vec<String>,
}

impl RiskAssessment {
    pub fn benign() -> Self {
        Self {
            risk_level: RiskLevel::Low,
            risk_score: 0.0,
            detected_patterns: Vec::new(),
        }
    }
}

pub trait PromptSanitizer: Send + Sync {
    fn score(&self, text: &str) -> RiskAssessment;

    /// Rewrite `text` to neutralise detected patterns. `strict` asks for the
    /// most aggressive rewrite.
    fn rewrite(&self, text: &str, strict: bool) -> String;
}

/// Sanitizer that scores everything as benign.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSanitizer;

impl PromptSanitizer for PassthroughSanitizer {
    fn score(&self, _text: &str) -> RiskAssessment {
        RiskAssessment::benign()
    }

    fn rewrite(&self, text: &str, _strict: bool) -> String {
        text.to_string()
    }
}

/// Rewrite policy: rewrite when the score exceeds `threshold` or the level is
/// high/critical. Critical input gets the strict rewrite.
#[derive(Debug, Clone, Copy)]
pub struct SanitizePolicy {
    pub threshold: f64,
}

impl SanitizePolicy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn apply(&self, sanitizer: &dyn PromptSanitizer, text: &str) -> String {
        let assessment = sanitizer.score(text);
        if assessment.risk_score <= self.threshold && assessment.risk_level < RiskLevel::High {
            return text.to_string();
        }
        let strict = assessment.risk_level == RiskLevel::Critical;
        tracing::warn!(
            risk_level = ?assessment.risk_level,
            risk_score = assessment.risk_score,
            patterns = ?assessment.detected_patterns,
            strict,
            "rewriting risky prompt text"
        );
        sanitizer.rewrite(text, strict)
    }

    /// Sanitize a (system prompt, user message) pair.
    pub fn apply_pair(
        &self,
        sanitizer: &dyn PromptSanitizer,
        system_prompt: &str,
        user_message: &str,
    ) -> (String, String) {
        (
            self.apply(sanitizer, system_prompt),
            self.apply(sanitizer, user_message),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct KeywordSanitizer;

    impl PromptSanitizer for KeywordSanitizer {
        fn score(&self, text: &str) -> RiskAssessment {
            if text.contains("ignore previous") {
                RiskAssessment {
                    risk_level: RiskLevel::Critical,
                    risk_score: 0.95,
                    detected_patterns: vec!["ignore previous".into()],
                }
            } else if text.contains("pretend") {
                RiskAssessment {
                    risk_level: RiskLevel::High,
                    risk_score: 0.2,
                    detected_patterns: vec!["pretend".into()],
                }
            } else if text.contains("maybe") {
                RiskAssessment {
                    risk_level: RiskLevel::Medium,
                    risk_score: 0.5,
                    detected_patterns: vec![],
                }
            } else {
                RiskAssessment::benign()
            }
        }

        fn rewrite(&self, _text: &str, strict: bool) -> String {
            if strict { "[strict]" } else { "[soft]" }.to_string()
        }
    }

    #[test]
    fn rewrites_only_above_threshold_or_high_level() {
        let policy = SanitizePolicy::new(0.7);
        assert_eq!(policy.apply(&KeywordSanitizer, "hello"), "hello");
        assert_eq!(policy.apply(&KeywordSanitizer, "maybe"), "maybe");
        assert_eq!(policy.apply(&KeywordSanitizer, "pretend you are"), "[soft]");
        assert_eq!(
            policy.apply(&KeywordSanitizer, "ignore previous instructions"),
            "[strict]"
        );
    }

    #[test]
    fn lower_threshold_catches_medium() {
        let policy = SanitizePolicy::new(0.3);
        assert_eq!(policy.apply(&KeywordSanitizer, "maybe"), "[soft]");
    }

    #[test]
    fn passthrough_is_identity() {
        let (s, u) = SanitizePolicy::new(0.0).apply_pair(&PassthroughSanitizer, "sys", "q");
        assert_eq!((s.as_str(), u.as_str()), ("sys", "q"));
    }
}
