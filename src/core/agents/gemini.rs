use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ClassificationAgent, classification_prompt, parse_verdict};
use crate::config::AgentConfig;
use crate::core::consensus::AgentVerdict;

// ── Gemini generateContent with inline image data ──

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResContent,
}

#[derive(Deserialize)]
struct GeminiResContent {
    parts: Vec<GeminiResPart>,
}

#[derive(Deserialize)]
struct GeminiResPart {
    text: String,
}

/// Classification agent speaking the Gemini generateContent wire format.
/// The API key rides as a query parameter and `{model}` in the base URL is
/// substituted per request.
pub struct GeminiVisionAgent {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl GeminiVisionAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ClassificationAgent for GeminiVisionAgent {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn classify(&self, artifact_b64: &str, guidance: &str) -> Result<AgentVerdict> {
        let req = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![
                    GeminiPart::Text {
                        text: classification_prompt(guidance),
                    },
                    GeminiPart::InlineData {
                        inline_data: InlineData {
                            mime_type: "image/jpeg".to_string(),
                            data: artifact_b64.to_string(),
                        },
                    },
                ],
            }],
        };

        let url = format!(
            "{}?key={}",
            self.base_url.replace("{model}", &self.model),
            self.api_key
        );
        let res = self.client.post(&url).json(&req).send().await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "Gemini agent API error ({}): {}",
                res.status(),
                res.text().await.unwrap_or_default()
            ));
        }

        let parsed: GeminiResponse = res.json().await?;
        let content = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| anyhow!("Gemini agent returned no candidates"))?;
        parse_verdict(&content)
    }
}
