//! Wire types for the remote auto-select collaborator. The endpoints are a
//! contract; these structs pin the payload shapes the core depends on and
//! tolerate extra fields the service may grow.

use crate::photos::model::AiConfidence;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct PricingRequest {
    pub photo_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingResponse {
    pub charged_photos: u64,
    pub total_cost: f64,
    pub is_free: bool,
    #[serde(default)]
    pub volume_limited: bool,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRequest {
    pub photo_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
    pub checkout_id: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutVerification {
    pub job_id: String,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub status: Option<String>,
}

/// One line of the grouping manifest submitted with `POST /job/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub id: String,
    pub filename: String,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoSelectSuggestion {
    pub id: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub confidence: Option<AiConfidence>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusResponse {
    pub status: JobState,
    #[serde(default)]
    pub processed: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub suggestions: Vec<AutoSelectSuggestion>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobStatusResponse {
    /// What a bare `202 Accepted` means: queued, nothing to report yet.
    pub fn pending() -> Self {
        Self {
            status: JobState::Pending,
            processed: None,
            total: None,
            suggestions: Vec::new(),
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, JobState::Completed | JobState::Failed)
    }
}

/// Structured error payload the service attaches to failure responses,
/// including 500s, whose bodies are still worth parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorBody {
    pub fn describe(&self) -> String {
        match &self.message {
            Some(message) => format!("{}: {}", self.error, message),
            None => self.error.clone(),
        }
    }
}
