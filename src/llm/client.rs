use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::llm::parse::parse_outcomes;
use crate::llm::prompts::{SYSTEM_PROMPT_BATCH_MATCH, SYSTEM_PROMPT_DEEP_INVESTIGATE};
use crate::llm::types::{
    EffortLevel, ReasoningOutcome, ReasoningRequest, ReasoningResponse, ReasoningService,
};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const LOW_EFFORT_MODEL: &str = "gemini-2.5-flash";
const HIGH_EFFORT_MODEL: &str = "gemini-2.5-pro";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<Part>,
}

/// Gemini-backed reasoning service. Effort levels map to different models;
/// the response schema is generated from `ReasoningResponse` so the model is
/// constrained to the verdict shape.
#[derive(Clone)]
pub struct GeminiReasoner {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiReasoner {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    fn model_for(effort: EffortLevel) -> &'static str {
        match effort {
            EffortLevel::Low => LOW_EFFORT_MODEL,
            EffortLevel::High => HIGH_EFFORT_MODEL,
        }
    }

    fn system_prompt_for(effort: EffortLevel) -> &'static str {
        match effort {
            EffortLevel::Low => SYSTEM_PROMPT_BATCH_MATCH,
            EffortLevel::High => SYSTEM_PROMPT_DEEP_INVESTIGATE,
        }
    }

    async fn generate_content(
        &self,
        model: &str,
        system_prompt: &str,
        user_text: String,
        response_schema: Option<serde_json::Value>,
    ) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        let payload = GenerateContentRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part::Text { text: user_text }],
            }],
            system_instruction: Some(Content {
                role: "user".to_string(),
                parts: vec![Part::Text {
                    text: system_prompt.to_string(),
                }],
            }),
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema,
            },
        };

        let res = self.client.post(&url).json(&payload).send().await?;
        let status = res.status();

        if !status.is_success() {
            let err_text = res.text().await?;
            return Err(ReconcileError::ReasoningFailed(format!(
                "Gemini API error (status {}): {}",
                status, err_text
            )));
        }

        let body: GenerateContentResponse = res.json().await?;
        let part = body
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content.parts.into_iter().next())
            .ok_or_else(|| {
                ReconcileError::ReasoningFailed("no candidates returned".to_string())
            })?;

        let Part::Text { text } = part;
        Ok(text)
    }
}

#[async_trait]
impl ReasoningService for GeminiReasoner {
    async fn analyze(
        &self,
        request: &ReasoningRequest,
        effort: EffortLevel,
    ) -> Result<Vec<ReasoningOutcome>> {
        let expected_ids: Vec<String> = request
            .transactions
            .iter()
            .map(|t| t.transaction_id.clone())
            .collect();

        let user_text = serde_json::to_string_pretty(request)?;
        let schema = serde_json::to_value(schemars::schema_for!(ReasoningResponse))?;

        let raw = self
            .generate_content(
                Self::model_for(effort),
                Self::system_prompt_for(effort),
                user_text,
                Some(schema),
            )
            .await?;

        // Malformed output degrades to needs_review per transaction instead
        // of failing the batch.
        Ok(parse_outcomes(&raw, &expected_ids))
    }
}
