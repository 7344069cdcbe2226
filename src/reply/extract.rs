//! Field extraction from free-text customer messages.
//!
//! The default extractor is a small regex rule set. When nothing matches and
//! the customer is answering a specific question, the whole message is taken
//! as a low-confidence answer to it.

use regex::Regex;

/// A value proposed for a field.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub field: String,
    pub value: String,
    pub confidence: f32,
}

/// Extracts candidate field values from text.
pub trait FieldExtractor: Send + Sync {
    /// `fields` are the fields the flow still cares about; `expecting` is the
    /// field the last question asked for.
    fn extract(&self, text: &str, fields: &[String], expecting: Option<&str>) -> Vec<Candidate>;
}

/// A compiled pattern whose first capture group is the value.
#[derive(Debug, Clone)]
pub struct FieldPattern {
    pub field: String,
    pub regex: Regex,
    pub confidence: f32,
}

/// Confidence for a bare answer to the question just asked.
const DIRECT_ANSWER_CONFIDENCE: f32 = 0.6;

/// Longest message accepted as a bare answer.
const DIRECT_ANSWER_MAX_CHARS: usize = 80;

pub struct RegexFieldExtractor {
    patterns: Vec<FieldPattern>,
}

impl Default for RegexFieldExtractor {
    fn default() -> Self {
        Self::default_patterns()
    }
}

impl RegexFieldExtractor {
    /// Patterns for name, email, phone, service and budget.
    pub fn default_patterns() -> Self {
        let patterns = vec![
            FieldPattern {
                field: "name".into(),
                regex: Regex::new(
                    r"\b(?i:my name is|i am|i'm|this is|call me)\s+([A-Z][a-z'\-]+(?:\s+[A-Z][a-z'\-]+)?)",
                )
                .unwrap(),
                confidence: 0.9,
            },
            FieldPattern {
                field: "email".into(),
                regex: Regex::new(r"(?i)\b([a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,})\b").unwrap(),
                confidence: 0.95,
            },
            FieldPattern {
                field: "phone".into(),
                regex: Regex::new(r"(\+?\d[\d\s\-().]{6,}\d)").unwrap(),
                confidence: 0.9,
            },
            FieldPattern {
                field: "service".into(),
                regex: Regex::new(
                    r"(?i)\b(?:interested in|looking for|need(?: a| an| some)?|want(?: a| an)?|quote for)\s+([^.,!?\n]{2,60})",
                )
                .unwrap(),
                confidence: 0.8,
            },
            FieldPattern {
                field: "budget".into(),
                regex: Regex::new(r"(?i)(?:budget\D{0,12})?((?:[$€£]\s?\d[\d,.]*k?)|(?:\d[\d,.]*\s?(?:usd|eur|gbp|dollars|euros)))").unwrap(),
                confidence: 0.85,
            },
        ];
        Self { patterns }
    }

    /// An extractor with no patterns; only direct answers are taken.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn add_pattern(
        &mut self,
        field: &str,
        pattern: &str,
        confidence: f32,
    ) -> Result<(), regex::Error> {
        self.patterns.push(FieldPattern {
            field: field.into(),
            regex: Regex::new(pattern)?,
            confidence: confidence.clamp(0.0, 1.0),
        });
        Ok(())
    }
}

impl FieldExtractor for RegexFieldExtractor {
    fn extract(&self, text: &str, fields: &[String], expecting: Option<&str>) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = Vec::new();

        for pattern in &self.patterns {
            if !fields.contains(&pattern.field)
                || candidates.iter().any(|c| c.field == pattern.field)
            {
                continue;
            }
            if let Some(value) = pattern
                .regex
                .captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|v| !v.is_empty())
            {
                candidates.push(Candidate {
                    field: pattern.field.clone(),
                    value,
                    confidence: pattern.confidence,
                });
            }
        }

        if let Some(field) = expecting
            && fields.iter().any(|f| f == field)
            && !candidates.iter().any(|c| c.field == field)
        {
            let answer = text.trim().trim_end_matches(['.', '!']).trim();
            if !answer.is_empty() && answer.chars().count() <= DIRECT_ANSWER_MAX_CHARS {
                candidates.push(Candidate {
                    field: field.to_string(),
                    value: answer.to_string(),
                    confidence: DIRECT_ANSWER_CONFIDENCE,
                });
            }
        }

        tracing::debug!(count = candidates.len(), "Extracted field candidates");
        candidates
    }
}
