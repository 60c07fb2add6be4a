use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{AnalyzeRequest, ModelList};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_FUND_ID: &str = "5800";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    Keywords,
    #[default]
    Llm,
    LlmWithFallback,
}

impl AnalysisMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMethod::Keywords => "keywords",
            AnalysisMethod::Llm => "llm",
            AnalysisMethod::LlmWithFallback => "llm_with_fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    Openai,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmProvider::Openai => "openai",
            LlmProvider::Ollama => "ollama",
        }
    }
}

/// Request parameters for one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub analysis_method: AnalysisMethod,
    pub llm_provider: LlmProvider,
    pub model: String,
    pub fund_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            analysis_method: AnalysisMethod::default(),
            llm_provider: LlmProvider::default(),
            model: DEFAULT_MODEL.to_string(),
            fund_id: DEFAULT_FUND_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    UnknownModel { model: String, available: Vec<String> },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::UnknownModel { model, available } => {
                if available.is_empty() {
                    write!(f, "model {model} is not offered by the backend (no models advertised)")
                } else {
                    write!(
                        f,
                        "model {model} is not offered by the backend; choose one of: {}",
                        available.join(", ")
                    )
                }
            }
        }
    }
}

impl std::error::Error for SettingsError {}

impl Settings {
    pub fn ensure_model_advertised(&self, models: &ModelList) -> Result<(), SettingsError> {
        if models.contains(&self.model) {
            return Ok(());
        }
        Err(SettingsError::UnknownModel {
            model: self.model.clone(),
            available: models.openai_models.clone(),
        })
    }

    pub fn analyze_request(&self, file_path: impl Into<String>) -> AnalyzeRequest {
        AnalyzeRequest {
            file_path: file_path.into(),
            analysis_method: self.analysis_method.as_str().to_string(),
            llm_provider: self.llm_provider.as_str().to_string(),
            model: self.model.clone(),
            fund_id: self.fund_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_analyze_request() {
        let settings = Settings::default();
        let request = settings.analyze_request("/tmp/x.pdf");
        assert_eq!(
            serde_json::to_value(&request).expect("serialize"),
            json!({
                "file_path": "/tmp/x.pdf",
                "analysis_method": "llm",
                "llm_provider": "openai",
                "model": "gpt-4o-mini",
                "fund_id": "5800"
            })
        );
    }

    #[test]
    fn rejects_unadvertised_model() {
        let models: ModelList =
            serde_json::from_value(json!({"openai_models": ["gpt-4o"]})).expect("models");
        let settings = Settings::default();
        let err = settings
            .ensure_model_advertised(&models)
            .expect_err("unknown model");
        assert!(err.to_string().contains("gpt-4o"));

        let settings = Settings {
            model: "gpt-4o".to_string(),
            ..Settings::default()
        };
        settings.ensure_model_advertised(&models).expect("advertised");
    }
}
