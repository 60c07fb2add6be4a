use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceList {
    #[serde(default)]
    pub traces: Vec<TraceSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceSummary {
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub file_sizes: BTreeMap<String, u64>,
}

impl TraceSummary {
    pub fn file_size(&self, filename: &str) -> u64 {
        self.file_sizes.get(filename).copied().unwrap_or(0)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|name| self.file_size(name)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_file_order_and_defaults_missing_sizes() {
        let trace: TraceSummary = serde_json::from_value(json!({
            "trace_id": "t-1",
            "files": ["prompt.txt", "response.json", "chunks.json"],
            "file_sizes": {"prompt.txt": 2048, "response.json": 512}
        }))
        .expect("trace");
        assert_eq!(trace.files[0], "prompt.txt");
        assert_eq!(trace.file_size("chunks.json"), 0);
        assert_eq!(trace.total_bytes(), 2560);
    }
}
