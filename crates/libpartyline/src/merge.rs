use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dedupe::PendingPrompt;
use crate::error::PartyError;

const GEMINI_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// External collaborator that merges queued prompts and summarizes a
/// session. The API key is passed per call so credential invalidation
/// stays in the pipeline, next to the policy that needs it.
#[async_trait]
pub trait PromptMerger: Send + Sync {
    async fn merge(&self, api_key: &str, prompts: &[PendingPrompt]) -> Result<String, PartyError>;

    async fn summarize(&self, api_key: &str, merged: &[String]) -> Result<String, PartyError>;
}

/// Gemini-backed merger.
pub struct GeminiMerger {
    client: Client,
}

impl GeminiMerger {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    async fn generate(&self, api_key: &str, prompt: String) -> Result<String, PartyError> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part { text: prompt }],
            }],
        };
        let response = self
            .client
            .post(GEMINI_ENDPOINT)
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| PartyError::Collaborator(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PartyError::CollaboratorAuth(format!(
                "Gemini API rejected the key: {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PartyError::Collaborator(format!(
                "Gemini API error: {status} {body}"
            )));
        }

        let data: GenerateResponse = response
            .json()
            .await
            .map_err(|e| PartyError::Collaborator(e.to_string()))?;
        let text: String = data
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(PartyError::Collaborator(
                "Gemini API returned empty content".to_string(),
            ));
        }
        Ok(text)
    }
}

impl Default for GeminiMerger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PromptMerger for GeminiMerger {
    async fn merge(&self, api_key: &str, prompts: &[PendingPrompt]) -> Result<String, PartyError> {
        self.generate(api_key, merge_instruction(prompts)).await
    }

    async fn summarize(&self, api_key: &str, merged: &[String]) -> Result<String, PartyError> {
        self.generate(api_key, summary_instruction(merged)).await
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Deserialize, Default)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

fn merge_instruction(prompts: &[PendingPrompt]) -> String {
    let mut lines = vec![
        "You are a deduplication agent.".to_string(),
        "Combine related user requests into a single multi-step prompt for a coding agent."
            .to_string(),
        "Remove duplicates, keep all unique requirements, and output ONLY the merged prompt."
            .to_string(),
        String::new(),
        "User prompts:".to_string(),
    ];
    for prompt in prompts {
        lines.push(format!("- {}: {}", prompt.user, prompt.text.trim()));
    }
    lines.join("\n")
}

fn summary_instruction(merged: &[String]) -> String {
    let mut lines = vec![
        "You are a session summarization agent for a shared coding session.".to_string(),
        "Summarize the following deduped prompts into a practical project context document."
            .to_string(),
        "Return Markdown only.".to_string(),
        "Include these sections in order:".to_string(),
        "## Session Goals".to_string(),
        "## Implemented Or Requested Work".to_string(),
        "## Open Questions Or Risks".to_string(),
        "## Next Steps".to_string(),
        String::new(),
        "Deduped prompts:".to_string(),
    ];
    for (idx, prompt) in merged.iter().enumerate() {
        lines.push(format!("### Prompt {}", idx + 1));
        lines.push(prompt.trim().to_string());
        lines.push(String::new());
    }
    lines.join("\n").trim().to_string()
}

/// Deterministic merge used when no collaborator credential is available.
pub fn merge_fallback(prompts: &[PendingPrompt]) -> String {
    let mut lines = vec!["Combine these prompts:".to_string(), String::new()];
    for prompt in prompts {
        lines.push(format!("- {}: {}", prompt.user, prompt.text.trim()));
    }
    lines.join("\n").trim().to_string()
}

/// Deterministic summary skeleton used when the collaborator is
/// unavailable or fails.
pub fn summary_fallback(merged: &[String]) -> String {
    let mut lines = vec![
        "## Session Goals".to_string(),
        "- Consolidate participant prompts into executable work.".to_string(),
        String::new(),
        "## Implemented Or Requested Work".to_string(),
    ];
    for (idx, prompt) in merged.iter().enumerate() {
        lines.push(format!("- Prompt {}: {}", idx + 1, prompt.trim()));
    }
    lines.push(String::new());
    lines.push("## Open Questions Or Risks".to_string());
    lines.push("- No Gemini summary available; review prompt list directly.".to_string());
    lines.push(String::new());
    lines.push("## Next Steps".to_string());
    lines.push("- Continue from the latest deduped prompt context.".to_string());
    lines.join("\n").trim().to_string()
}
