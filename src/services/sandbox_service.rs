use crate::models::snapshot::CodeTestCase;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Client for the sandboxed code-execution collaborator. A sandbox-side
/// timeout or crash is a failed run, not a system error, so `execute`
/// never surfaces transport failures to grading.
#[derive(Clone)]
pub struct SandboxService {
    client: Client,
    base_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxRequest {
    pub code: String,
    pub language: String,
    pub test_cases: Vec<CodeTestCase>,
    pub runtime: String,
    pub entry_function: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub overall_passed: bool,
    #[serde(default)]
    pub per_test_results: Vec<SandboxTestResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxTestResult {
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub output: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SandboxService {
    pub fn new(base_url: String, timeout: std::time::Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    pub fn from_config() -> Self {
        let config = crate::config::get_config();
        Self::new(
            config.sandbox_url.clone(),
            std::time::Duration::from_millis(config.sandbox_timeout_ms),
        )
    }

    pub async fn execute(&self, request: &SandboxRequest) -> SandboxOutcome {
        let url = format!("{}/execute", self.base_url);
        match self.client.post(&url).json(request).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<SandboxOutcome>().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = ?e, "sandbox returned an unreadable response");
                    SandboxOutcome::default()
                }
            },
            Ok(resp) => {
                tracing::error!(status = %resp.status(), "sandbox rejected execution request");
                SandboxOutcome::default()
            }
            Err(e) => {
                tracing::error!(error = ?e, "sandbox unreachable");
                SandboxOutcome::default()
            }
        }
    }
}
