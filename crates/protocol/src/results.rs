//! Analysis results as returned by `GET /api/jobs/:id/results`.
//!
//! The backend ships `sections` as a loosely shaped object of objects. It is
//! validated once on ingress into an ordered list of
//! `(section, instrument, record)` triples and serialized back into the same
//! wire shape, so a result exported as JSON parses into an identical value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;

/// Per-section key that carries free-form restrictions rather than an instrument.
pub const RESTRICTIONS_KEY: &str = "special_other_restrictions";

#[derive(Debug, Clone, PartialEq)]
pub struct Evidence {
    pub text: String,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentRecord {
    /// `None` means manual approval is required.
    pub allowed: Option<bool>,
    pub confidence: Option<f64>,
    pub note: String,
    pub evidence: Evidence,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentEntry {
    pub section: String,
    pub instrument: String,
    pub record: InstrumentRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionRestriction {
    pub section: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AnalysisResultWire", into = "AnalysisResultWire")]
pub struct AnalysisResult {
    pub section_names: Vec<String>,
    pub entries: Vec<InstrumentEntry>,
    pub restrictions: Vec<SectionRestriction>,
    pub total_instruments: u64,
    pub allowed_instruments: u64,
    /// Share of allowed instruments backed by evidence, 0 to 100.
    pub evidence_coverage: f64,
    pub confidence_score: f64,
    pub processing_time: f64,
    pub trace_id: Option<String>,
    pub extra: Map<String, Value>,
}

impl AnalysisResult {
    pub fn instrument(&self, section: &str, instrument: &str) -> Option<&InstrumentRecord> {
        self.entries
            .iter()
            .find(|entry| entry.section == section && entry.instrument == instrument)
            .map(|entry| &entry.record)
    }

    pub fn entries_in<'a>(&'a self, section: &'a str) -> impl Iterator<Item = &'a InstrumentEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.section == section)
    }

    pub fn manual_approval_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.record.allowed.is_none())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub path: String,
    pub reason: String,
}

impl SchemaError {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid analysis result at {}: {}", self.path, self.reason)
    }
}

impl std::error::Error for SchemaError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnalysisResultWire {
    sections: Map<String, Value>,
    #[serde(default)]
    total_instruments: u64,
    #[serde(default)]
    allowed_instruments: u64,
    #[serde(default)]
    evidence_coverage: f64,
    #[serde(default)]
    confidence_score: f64,
    #[serde(default)]
    processing_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<AnalysisResultWire> for AnalysisResult {
    type Error = SchemaError;

    fn try_from(wire: AnalysisResultWire) -> Result<Self, Self::Error> {
        let mut section_names = Vec::with_capacity(wire.sections.len());
        let mut entries = Vec::new();
        let mut restrictions = Vec::new();
        for (section, items) in wire.sections {
            let Value::Object(items) = items else {
                return Err(SchemaError::new(
                    format!("sections.{section}"),
                    "expected an object of instruments",
                ));
            };
            for (instrument, value) in items {
                if instrument == RESTRICTIONS_KEY {
                    restrictions.push(SectionRestriction {
                        section: section.clone(),
                        value,
                    });
                    continue;
                }
                let path = format!("sections.{section}.{instrument}");
                let record = parse_record(&path, value)?;
                entries.push(InstrumentEntry {
                    section: section.clone(),
                    instrument,
                    record,
                });
            }
            section_names.push(section);
        }
        Ok(Self {
            section_names,
            entries,
            restrictions,
            total_instruments: wire.total_instruments,
            allowed_instruments: wire.allowed_instruments,
            evidence_coverage: wire.evidence_coverage,
            confidence_score: wire.confidence_score,
            processing_time: wire.processing_time,
            trace_id: wire.trace_id,
            extra: wire.extra,
        })
    }
}

impl From<AnalysisResult> for AnalysisResultWire {
    fn from(result: AnalysisResult) -> Self {
        let mut sections = Map::new();
        for name in &result.section_names {
            sections.insert(name.clone(), Value::Object(Map::new()));
        }
        for entry in result.entries {
            let slot = sections
                .entry(entry.section)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(items) = slot {
                items.insert(entry.instrument, record_to_value(entry.record));
            }
        }
        for restriction in result.restrictions {
            let slot = sections
                .entry(restriction.section)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(items) = slot {
                items.insert(RESTRICTIONS_KEY.to_string(), restriction.value);
            }
        }
        Self {
            sections,
            total_instruments: result.total_instruments,
            allowed_instruments: result.allowed_instruments,
            evidence_coverage: result.evidence_coverage,
            confidence_score: result.confidence_score,
            processing_time: result.processing_time,
            trace_id: result.trace_id,
            extra: result.extra,
        }
    }
}

fn parse_record(path: &str, value: Value) -> Result<InstrumentRecord, SchemaError> {
    let Value::Object(mut fields) = value else {
        return Err(SchemaError::new(path, "expected an instrument object"));
    };
    let allowed = match fields.remove("allowed") {
        Some(Value::Bool(flag)) => Some(flag),
        Some(Value::Null) => None,
        Some(_) => {
            return Err(SchemaError::new(
                format!("{path}.allowed"),
                "expected true, false or null",
            ))
        }
        None => return Err(SchemaError::new(format!("{path}.allowed"), "missing")),
    };
    let confidence = match fields.remove("confidence") {
        None | Some(Value::Null) => None,
        Some(Value::Number(number)) => {
            let value = number.as_f64().unwrap_or(f64::NAN);
            if !(0.0..=1.0).contains(&value) {
                return Err(SchemaError::new(
                    format!("{path}.confidence"),
                    "expected a number between 0 and 1",
                ));
            }
            Some(value)
        }
        Some(_) => {
            return Err(SchemaError::new(
                format!("{path}.confidence"),
                "expected a number or null",
            ))
        }
    };
    let note = match fields.remove("note") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(note)) => note,
        Some(_) => return Err(SchemaError::new(format!("{path}.note"), "expected a string")),
    };
    let evidence = parse_evidence(&format!("{path}.evidence"), fields.remove("evidence"))?;
    Ok(InstrumentRecord {
        allowed,
        confidence,
        note,
        evidence,
        extra: fields,
    })
}

fn parse_evidence(path: &str, value: Option<Value>) -> Result<Evidence, SchemaError> {
    match value {
        None | Some(Value::Null) => Ok(Evidence {
            text: String::new(),
            page: None,
        }),
        // Older backends sent the evidence snippet as a bare string.
        Some(Value::String(text)) => Ok(Evidence { text, page: None }),
        Some(Value::Object(mut fields)) => {
            let text = match fields.remove("text") {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(text)) => text,
                Some(_) => return Err(SchemaError::new(format!("{path}.text"), "expected a string")),
            };
            let page = match fields.remove("page") {
                None | Some(Value::Null) => None,
                Some(Value::Number(number)) => number
                    .as_u64()
                    .and_then(|page| u32::try_from(page).ok())
                    .map(Some)
                    .ok_or_else(|| {
                        SchemaError::new(format!("{path}.page"), "expected a page number")
                    })?,
                Some(_) => {
                    return Err(SchemaError::new(
                        format!("{path}.page"),
                        "expected a page number",
                    ))
                }
            };
            Ok(Evidence { text, page })
        }
        Some(_) => Err(SchemaError::new(path, "expected an object or a string")),
    }
}

fn record_to_value(record: InstrumentRecord) -> Value {
    let mut fields = Map::new();
    fields.insert(
        "allowed".to_string(),
        record.allowed.map(Value::Bool).unwrap_or(Value::Null),
    );
    if let Some(confidence) = record.confidence.and_then(Number::from_f64) {
        fields.insert("confidence".to_string(), Value::Number(confidence));
    }
    fields.insert("note".to_string(), Value::String(record.note));
    let mut evidence = Map::new();
    evidence.insert("text".to_string(), Value::String(record.evidence.text));
    if let Some(page) = record.evidence.page {
        evidence.insert("page".to_string(), Value::from(page));
    }
    fields.insert("evidence".to_string(), Value::Object(evidence));
    fields.extend(record.extra);
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "sections": {
                "future": {
                    "equity_future": {
                        "allowed": true,
                        "confidence": 0.92,
                        "note": "Explicitly permitted",
                        "evidence": {"text": "The fund may invest in equity futures", "page": 4}
                    },
                    "commodity_future": {
                        "allowed": null,
                        "confidence": null,
                        "note": "Requires manual approval",
                        "evidence": {"text": ""}
                    },
                    "special_other_restrictions": ["no leverage above 2x"]
                },
                "option": {
                    "equity_option": {
                        "allowed": false,
                        "note": "",
                        "evidence": "Options are prohibited"
                    }
                },
                "warrant": {}
            },
            "total_instruments": 3,
            "allowed_instruments": 1,
            "evidence_coverage": 66.7,
            "confidence_score": 0.81,
            "processing_time": 12.4,
            "trace_id": "trace-1",
            "model": "gpt-4o-mini"
        })
    }

    #[test]
    fn parses_sections_into_triples() {
        let result: AnalysisResult = serde_json::from_value(sample()).expect("result");
        assert_eq!(result.section_names, vec!["future", "option", "warrant"]);
        assert_eq!(result.entries.len(), 3);
        assert_eq!(result.restrictions.len(), 1);
        let manual = result
            .instrument("future", "commodity_future")
            .expect("instrument");
        assert_eq!(manual.allowed, None);
        let option = result.instrument("option", "equity_option").expect("instrument");
        assert_eq!(option.allowed, Some(false));
        assert_eq!(option.evidence.text, "Options are prohibited");
        assert_eq!(result.manual_approval_count(), 1);
        assert_eq!(result.extra.get("model"), Some(&json!("gpt-4o-mini")));
    }

    #[test]
    fn export_then_parse_is_identical() {
        let result: AnalysisResult = serde_json::from_value(sample()).expect("result");
        let exported = serde_json::to_string_pretty(&result).expect("export");
        let reparsed: AnalysisResult = serde_json::from_str(&exported).expect("reparse");
        assert_eq!(result, reparsed);
    }

    #[test]
    fn null_allowed_survives_export() {
        let result: AnalysisResult = serde_json::from_value(sample()).expect("result");
        let exported = serde_json::to_value(&result).expect("export");
        assert_eq!(
            exported["sections"]["future"]["commodity_future"]["allowed"],
            Value::Null
        );
        assert_eq!(
            exported["sections"]["future"]["special_other_restrictions"],
            json!(["no leverage above 2x"])
        );
        assert_eq!(exported["sections"]["warrant"], json!({}));
    }

    #[test]
    fn missing_allowed_is_rejected() {
        let err = serde_json::from_value::<AnalysisResult>(json!({
            "sections": {"future": {"equity_future": {"note": "", "evidence": {"text": ""}}}}
        }))
        .expect_err("missing allowed");
        assert!(err.to_string().contains("sections.future.equity_future.allowed"));
    }

    #[test]
    fn flat_section_is_rejected() {
        let err = serde_json::from_value::<AnalysisResult>(json!({
            "sections": {"future": true}
        }))
        .expect_err("flat section");
        assert!(err.to_string().contains("sections.future"));
    }

    #[test]
    fn confidence_out_of_range_is_rejected() {
        let err = serde_json::from_value::<AnalysisResult>(json!({
            "sections": {"future": {"equity_future": {"allowed": true, "confidence": 3}}}
        }))
        .expect_err("confidence");
        assert!(err.to_string().contains("confidence"));
    }
}
