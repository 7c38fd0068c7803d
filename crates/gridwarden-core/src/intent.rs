//! Request intent classification
//!
//! Routes read-only questions to the reactive loop in read-only mode. The
//! default classifier scores weighted keyword patterns; anything smarter can
//! sit behind the same trait.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a request wants done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Look something up without changing anything
    Query,
    /// Change the sheet
    Mutation,
    /// Derive new figures (usually written back)
    Analysis,
    /// No signal either way
    Unknown,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Query => write!(f, "query"),
            Intent::Mutation => write!(f, "mutation"),
            Intent::Analysis => write!(f, "analysis"),
            Intent::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classifier verdict
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    /// Winning intent
    pub intent: Intent,
    /// 0.0 to 1.0
    pub confidence: f64,
}

impl IntentClassification {
    /// Read-only with enough confidence to restrict the executor
    pub fn is_confident_query(&self, threshold: f64) -> bool {
        self.intent == Intent::Query && self.confidence >= threshold
    }
}

/// Classifies requests before planning
pub trait IntentClassifier: Send + Sync {
    /// Classify a request
    fn classify(&self, request: &str) -> IntentClassification;
}

lazy_static! {
    static ref PATTERNS: Vec<(Intent, Regex, f64)> = vec![
        (Intent::Query, Regex::new(r"(?i)^\s*(what|which|how many|how much|where|is|are|does|do|show|list|tell me)\b").unwrap(), 1.0),
        (Intent::Query, Regex::new(r"(?i)\b(look up|find|read|check|count|value of|contents? of)\b").unwrap(), 0.6),
        (Intent::Query, Regex::new(r"\?\s*$").unwrap(), 0.5),
        (Intent::Mutation, Regex::new(r"(?i)\b(write|set|put|fill|insert|add|delete|remove|clear|rename|move|copy|paste|replace|format|update|change|sort)\b").unwrap(), 1.0),
        (Intent::Mutation, Regex::new(r"(?i)\b(rows?|columns?|sheet|cells?)\b.*\b(to|into|with)\b").unwrap(), 0.3),
        (Intent::Analysis, Regex::new(r"(?i)\b(sum|total|average|mean|median|aggregate|pivot|summari[sz]e|group by|breakdown|trend|forecast|chart)\b").unwrap(), 0.8),
    ];
}

/// Weighted keyword classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    /// New classifier
    pub fn new() -> Self {
        Self
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, request: &str) -> IntentClassification {
        let mut scores = [
            (Intent::Query, 0.0_f64),
            (Intent::Mutation, 0.0),
            (Intent::Analysis, 0.0),
        ];
        for (intent, regex, weight) in PATTERNS.iter() {
            if regex.is_match(request) {
                if let Some(entry) = scores.iter_mut().find(|(i, _)| i == intent) {
                    entry.1 += weight;
                }
            }
        }

        let total: f64 = scores.iter().map(|(_, s)| s).sum();
        if total == 0.0 {
            return IntentClassification {
                intent: Intent::Unknown,
                confidence: 0.0,
            };
        }
        // Any mutation wording outranks a question form: "can you delete row 3?"
        let (intent, score) = if scores[1].1 >= 1.0 {
            scores[1]
        } else {
            scores
                .iter()
                .copied()
                .fold((Intent::Unknown, 0.0), |best, s| if s.1 > best.1 { s } else { best })
        };
        IntentClassification {
            intent,
            confidence: (score / total).min(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn questions_are_queries() {
        let c = KeywordClassifier::new().classify("What is the value of B4 on Sales?");
        assert_eq!(c.intent, Intent::Query);
        assert!(c.is_confident_query(0.6));
    }

    #[test]
    fn mutation_wording_wins_over_question_form() {
        let c = KeywordClassifier::new().classify("Can you delete rows 3 to 5?");
        assert_eq!(c.intent, Intent::Mutation);
        assert!(!c.is_confident_query(0.0));
    }

    #[test]
    fn analysis_and_unknown() {
        let classifier = KeywordClassifier::new();
        assert_eq!(
            classifier.classify("Summarize revenue by region").intent,
            Intent::Analysis
        );
        let unknown = classifier.classify("banana");
        assert_eq!(unknown.intent, Intent::Unknown);
        assert_eq!(unknown.confidence, 0.0);
    }
}
