use std::{fmt::Write as _, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::Adjudicator;
use crate::{
    error::AdjudicationError,
    llm::{extract_json_object, LanguageModel, Prompt},
    model::{Claim, Evidence, Verdict, VerdictResult},
};

const SYSTEM_PROMPT: &str = "You are a meticulous fact-checker. Judge the claim strictly \
against the numbered evidence. Respond with a JSON object: {\"result\": \"SUPPORTED\" | \
\"REFUTED\" | \"INSUFFICIENT\", \"reasoning\": string citing the evidence numbers you relied \
on, \"cited_urls\": [urls of the evidence you relied on], \"confidence\": integer 0-100}. \
Use INSUFFICIENT when the evidence is missing, off-topic or conflicting.";

/// Confidence used when the evidence list is empty.
const EMPTY_EVIDENCE_CONFIDENCE: f64 = 20.0;

/// Adjudicates through a language model with structured JSON output.
pub struct LlmAdjudicator {
    model: Arc<dyn LanguageModel>,
}

impl LlmAdjudicator {
    /// Creates the adjudicator.
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    fn prompt(claim: &Claim, evidence: &[Evidence]) -> Prompt {
        let mut user = format!("Claim: {}\n\nEvidence:\n", claim.text());
        for (idx, item) in evidence.iter().enumerate() {
            let _ = writeln!(
                user,
                "[{}] {} ({})\n{}\n",
                idx + 1,
                item.title,
                item.url,
                item.snippet
            );
        }
        Prompt::new(SYSTEM_PROMPT, user).expect_json()
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    result: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default, alias = "sources")]
    cited_urls: Vec<String>,
    #[serde(default)]
    confidence: Option<Value>,
}

fn parse_confidence(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').parse().unwrap_or(0.0),
        _ => 0.0,
    };
    // Fractions in (0, 1] are read as probabilities.
    if raw > 0.0 && raw <= 1.0 {
        raw * 100.0
    } else {
        raw
    }
}

fn parse_verdict(claim: &Claim, evidence: &[Evidence], raw: &str) -> Result<Verdict, AdjudicationError> {
    let value = extract_json_object(raw)
        .ok_or_else(|| AdjudicationError::Malformed("no JSON object in response".into()))?;
    let parsed: RawVerdict =
        serde_json::from_value(value).map_err(|err| AdjudicationError::Malformed(err.to_string()))?;
    let result: VerdictResult = parsed.result.parse().map_err(AdjudicationError::Malformed)?;
    let cited = parsed
        .cited_urls
        .iter()
        .filter_map(|url| evidence.iter().find(|item| item.url == url.trim()))
        .cloned()
        .collect();
    Ok(Verdict::new(
        claim,
        result,
        parsed.reasoning,
        cited,
        parse_confidence(parsed.confidence.as_ref()),
    ))
}

#[async_trait]
impl Adjudicator for LlmAdjudicator {
    fn name(&self) -> &str {
        self.model.name()
    }

    async fn evaluate(&self, claim: &Claim, evidence: &[Evidence]) -> Result<Verdict, AdjudicationError> {
        if evidence.is_empty() {
            return Ok(Verdict::insufficient(
                claim,
                "No evidence was retrieved for this claim.",
                EMPTY_EVIDENCE_CONFIDENCE,
            ));
        }
        let raw = self.model.complete(&Self::prompt(claim, evidence)).await?;
        parse_verdict(claim, evidence, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedModel;

    fn evidence() -> Vec<Evidence> {
        vec![
            Evidence::new("https://a.example/1", "A", "Water boils at 100 C at sea level."),
            Evidence::new("https://b.example/1", "B", "Boiling point depends on pressure."),
        ]
    }

    #[tokio::test]
    async fn parses_fenced_structured_output() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            "```json\n{\"result\": \"SUPPORTED\", \"reasoning\": \"[1] states it\", \
             \"cited_urls\": [\"https://a.example/1\", \"https://nowhere.example\"], \
             \"confidence\": 0.9}\n```"
                .to_string(),
        )]));
        let adjudicator = LlmAdjudicator::new(model.clone());
        let claim = Claim::new("c1", "Water boils at 100 C");
        let verdict = adjudicator.evaluate(&claim, &evidence()).await.unwrap();
        assert_eq!(verdict.result, VerdictResult::Supported);
        assert_eq!(verdict.confidence, 90);
        assert_eq!(verdict.cited_urls(), vec!["https://a.example/1"]);
        assert!(model.prompts()[0].user.contains("[2] B (https://b.example/1)"));
    }

    #[tokio::test]
    async fn unknown_label_is_malformed() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            "{\"result\": \"PROBABLY\", \"reasoning\": \"?\"}".to_string(),
        )]));
        let adjudicator = LlmAdjudicator::new(model);
        let claim = Claim::new("c1", "claim");
        let err = adjudicator.evaluate(&claim, &evidence()).await.unwrap_err();
        assert!(matches!(err, AdjudicationError::Malformed(_)));
    }

    #[tokio::test]
    async fn empty_evidence_skips_the_model() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let adjudicator = LlmAdjudicator::new(model.clone());
        let claim = Claim::new("c1", "claim");
        let verdict = adjudicator.evaluate(&claim, &[]).await.unwrap();
        assert_eq!(verdict.result, VerdictResult::Insufficient);
        assert_eq!(verdict.confidence, 20);
        assert!(model.prompts().is_empty());
    }

    #[test]
    fn confidence_accepts_strings_and_fractions() {
        assert!((parse_confidence(Some(&Value::from("75%"))) - 75.0).abs() < f64::EPSILON);
        assert!((parse_confidence(Some(&Value::from(0.5))) - 50.0).abs() < f64::EPSILON);
        assert!(parse_confidence(None).abs() < f64::EPSILON);
    }
}
