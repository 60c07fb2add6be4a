use protocol::{AnalysisResult, Evidence, JobState, JobStatus, TraceList, TraceSummary};
use std::fmt::Write as _;

const EVIDENCE_LIMIT: usize = 100;
const NO_EVIDENCE: &str = "No evidence found";
const SIZE_UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

/// Where a run is in its lifecycle, driven only by received statuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    #[default]
    Idle,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }

    /// Terminal phases never change; otherwise phases only move forward.
    pub fn advance(self, state: JobState) -> RunPhase {
        if self.is_terminal() {
            return self;
        }
        let next = match state {
            JobState::Queued => RunPhase::Queued,
            JobState::Processing => RunPhase::Processing,
            JobState::Completed => RunPhase::Completed,
            JobState::Failed => RunPhase::Failed,
        };
        self.max(next)
    }

    pub fn label(self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Queued => "queued",
            RunPhase::Processing => "processing",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunView {
    job_id: Option<String>,
    phase: RunPhase,
    last: Option<JobStatus>,
}

impl RunView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, job_id: &str) {
        self.job_id = Some(job_id.to_string());
        self.phase = RunPhase::Queued;
        self.last = None;
    }

    /// Applies a status for the current job. Statuses for other jobs and
    /// anything after a terminal phase are ignored.
    pub fn observe(&mut self, status: &JobStatus) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        if let Some(job_id) = self.job_id.as_deref() {
            if !status.job_id.is_empty() && status.job_id != job_id {
                return false;
            }
        }
        self.phase = self.phase.advance(status.status);
        self.last = Some(status.clone());
        true
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn last_status(&self) -> Option<&JobStatus> {
        self.last.as_ref()
    }

    pub fn error_message(&self) -> Option<String> {
        if self.phase != RunPhase::Failed {
            return None;
        }
        let status = self.last.as_ref()?;
        let message = status
            .error
            .clone()
            .filter(|error| !error.trim().is_empty())
            .unwrap_or_else(|| status.message.clone());
        Some(if message.trim().is_empty() {
            "Analysis failed".to_string()
        } else {
            message
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Badge {
    Allowed,
    NotAllowed,
    ManualApproval,
}

impl Badge {
    pub fn from_allowed(allowed: Option<bool>) -> Self {
        match allowed {
            Some(true) => Badge::Allowed,
            Some(false) => Badge::NotAllowed,
            None => Badge::ManualApproval,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Badge::Allowed => "Allowed",
            Badge::NotAllowed => "Not Allowed",
            Badge::ManualApproval => "Manual Approval Required",
        }
    }
}

pub fn render_progress(status: &JobStatus, width: usize) -> String {
    let percent = status.percent();
    let filled = ((percent / 100.0) * width as f64).round() as usize;
    let filled = filled.min(width);
    let mut line = format!(
        "[{}{}] {:>3.0}% {}",
        "#".repeat(filled),
        "-".repeat(width - filled),
        percent,
        status.status.as_str()
    );
    if !status.message.trim().is_empty() {
        line.push_str("  ");
        line.push_str(status.message.trim());
    }
    line
}

pub fn format_confidence(confidence: Option<f64>) -> String {
    match confidence {
        Some(value) => format!("{:.0}%", value * 100.0),
        None => "-".to_string(),
    }
}

pub fn format_evidence(evidence: &Evidence) -> String {
    let text = evidence.text.trim();
    if text.is_empty() {
        return NO_EVIDENCE.to_string();
    }
    let mut shown: String = text.chars().take(EVIDENCE_LIMIT).collect();
    if text.chars().count() > EVIDENCE_LIMIT {
        shown.push_str("...");
    }
    match evidence.page {
        Some(page) => format!("{shown} (p. {page})"),
        None => shown,
    }
}

pub fn render_results(result: &AnalysisResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Analysis Results");
    kv_line(&mut out, "Total Instruments", result.total_instruments.to_string());
    kv_line(&mut out, "Allowed", result.allowed_instruments.to_string());
    kv_line(
        &mut out,
        "Manual Approval",
        result.manual_approval_count().to_string(),
    );
    kv_line(
        &mut out,
        "Evidence Coverage",
        format!("{:.1}%", result.evidence_coverage),
    );
    kv_line(
        &mut out,
        "Confidence",
        format!("{:.1}%", result.confidence_score * 100.0),
    );
    kv_line(
        &mut out,
        "Processing Time",
        format!("{:.1}s", result.processing_time),
    );
    if let Some(trace_id) = result.trace_id.as_deref() {
        kv_line(&mut out, "Trace", trace_id.to_string());
    }
    out.push('\n');

    let header = ["Section", "Instrument", "Status", "Confidence", "Note", "Evidence"];
    let rows: Vec<[String; 6]> = result
        .entries
        .iter()
        .map(|entry| {
            let note = entry.record.note.trim();
            [
                entry.section.clone(),
                entry.instrument.clone(),
                Badge::from_allowed(entry.record.allowed).label().to_string(),
                format_confidence(entry.record.confidence),
                if note.is_empty() { "-".to_string() } else { note.to_string() },
                format_evidence(&entry.record.evidence),
            ]
        })
        .collect();
    let mut widths = header.map(|title| title.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()).take(5) {
            *width = (*width).max(cell.chars().count());
        }
    }
    push_row(&mut out, &header.map(str::to_string), &widths);
    let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
    let _ = writeln!(out, "{}", rule.join("  "));
    for row in &rows {
        push_row(&mut out, row, &widths);
    }
    if rows.is_empty() {
        let _ = writeln!(out, "(no instruments)");
    }
    out
}

fn push_row(out: &mut String, cells: &[String; 6], widths: &[usize; 6]) {
    let mut line = String::new();
    for (index, cell) in cells.iter().enumerate() {
        if index > 0 {
            line.push_str("  ");
        }
        if index == cells.len() - 1 {
            line.push_str(cell);
        } else {
            let pad = widths[index].saturating_sub(cell.chars().count());
            line.push_str(cell);
            line.push_str(&" ".repeat(pad));
        }
    }
    let _ = writeln!(out, "{}", line.trim_end());
}

fn kv_line(out: &mut String, key: &str, value: String) {
    let _ = writeln!(out, "  {key:<18} {value}");
}

pub fn render_error_banner(context: &str, message: &str) -> String {
    let body = if context.is_empty() {
        message.to_string()
    } else {
        format!("{context}: {message}")
    };
    let width = body.chars().count().max(5) + 4;
    let border = "=".repeat(width);
    format!("{border}\n  ERROR\n  {body}\n{border}")
}

/// Binary units with at most two decimals: `1536` is `1.5 KB`.
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", SIZE_UNITS[unit])
}

pub fn render_trace_list(list: &TraceList) -> String {
    if list.traces.is_empty() {
        return "No traces recorded".to_string();
    }
    let mut out = String::new();
    for trace in &list.traces {
        let _ = writeln!(
            out,
            "{}  {}  {} file(s)  {}",
            trace.trace_id,
            trace.created_at.as_deref().unwrap_or("-"),
            trace.files.len(),
            format_file_size(trace.total_bytes())
        );
    }
    out
}

pub fn render_trace(trace: &TraceSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Trace {}", trace.trace_id);
    if let Some(created_at) = trace.created_at.as_deref() {
        kv_line(&mut out, "Created", created_at.to_string());
    }
    if let Some(dir) = trace.trace_dir.as_deref() {
        kv_line(&mut out, "Directory", dir.to_string());
    }
    kv_line(&mut out, "Total Size", format_file_size(trace.total_bytes()));
    for file in &trace.files {
        let _ = writeln!(out, "    {file}  {}", format_file_size(trace.file_size(file)));
    }
    out
}
