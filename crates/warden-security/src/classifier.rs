use serde::Deserialize;
use tracing::debug;
use warden_core::{LlmClassifierPort, LlmRisk, Result};

const MAX_INPUT_CHARS: usize = 1200;

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    #[serde(default)]
    risk: String,
}

/// Second input-security layer: a small remote classifier invoked only when
/// the regex stage already allows a message. Talks to an HTTP endpoint that
/// returns `{"risk": "low"|"medium"|"high"}`; transport or parse failures
/// are the caller's responsibility to treat as fail-open.
pub struct HttpInputClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpInputClassifier {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait::async_trait]
impl LlmClassifierPort for HttpInputClassifier {
    async fn classify(&self, text: &str) -> Result<LlmRisk> {
        let compact: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let truncated: String = compact.chars().take(MAX_INPUT_CHARS).collect();

        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "text": truncated }))
            .send()
            .await
            .map_err(|e| warden_core::WardenError::Security(e.to_string()))?
            .json::<ClassifierResponse>()
            .await
            .map_err(|e| {
                debug!(error = %e, "security classifier returned unparseable response");
                warden_core::WardenError::Security(e.to_string())
            })?;

        Ok(match response.risk.to_lowercase().as_str() {
            "high" => LlmRisk::High,
            "medium" => LlmRisk::Medium,
            _ => LlmRisk::Low,
        })
    }
}
