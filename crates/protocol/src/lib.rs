use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod results;
pub mod settings;
pub mod traces;

pub use results::{
    AnalysisResult, Evidence, InstrumentEntry, InstrumentRecord, SchemaError, SectionRestriction,
};
pub use settings::{AnalysisMethod, LlmProvider, Settings, SettingsError};
pub use traces::{TraceList, TraceSummary};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    /// Once a job reports a terminal state the backend never moves it again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    #[serde(default)]
    pub job_id: String,
    pub status: JobState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Progress clamped into 0..=100 for display.
    pub fn percent(&self) -> f64 {
        if self.progress.is_finite() {
            self.progress.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

/// Returned by `POST /api/analyze`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDescriptor {
    pub job_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Returned by `POST /api/upload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadReceipt {
    pub file_path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyzeRequest {
    pub file_path: String,
    pub analysis_method: String,
    pub llm_provider: String,
    pub model: String,
    pub fund_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelList {
    #[serde(default)]
    pub openai_models: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelList {
    pub fn contains(&self, model: &str) -> bool {
        self.openai_models.iter().any(|candidate| candidate == model)
    }
}

/// Health document served by the gateway itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayHealth {
    pub status: String,
    pub timestamp: String,
    pub backend: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn job_status_parses_backend_shape() {
        let status: JobStatus = serde_json::from_value(json!({
            "job_id": "abc123",
            "status": "processing",
            "progress": 42.5,
            "message": "Extracting rules"
        }))
        .expect("status");
        assert_eq!(status.status, JobState::Processing);
        assert_eq!(status.percent(), 42.5);
        assert!(status.error.is_none());
    }

    #[test]
    fn percent_is_clamped() {
        let status: JobStatus =
            serde_json::from_value(json!({"status": "queued", "progress": 140})).expect("status");
        assert_eq!(status.percent(), 100.0);
    }

    #[test]
    fn job_descriptor_keeps_unknown_fields() {
        let raw = json!({"job_id": "abc123", "status": "queued", "eta": 30});
        let descriptor: JobDescriptor = serde_json::from_value(raw.clone()).expect("descriptor");
        assert_eq!(descriptor.job_id, "abc123");
        assert_eq!(serde_json::to_value(&descriptor).expect("serialize"), raw);
    }

    #[test]
    fn model_list_lookup() {
        let models: ModelList = serde_json::from_value(json!({
            "openai_models": ["gpt-4o-mini", "gpt-4o"],
            "default_model": "gpt-4o-mini"
        }))
        .expect("models");
        assert!(models.contains("gpt-4o"));
        assert!(!models.contains("llama3"));
    }
}
