//! Latency and status panel for a checkout session

use crate::session::{ProcessingPhase, SessionSnapshot};
use std::fmt;

/// `"12.34ms"`, or `"N/A"` when the value is not known yet
pub fn format_latency(ms: Option<f64>) -> String {
    match ms {
        Some(ms) => format!("{ms:.2}ms"),
        None => "N/A".to_string(),
    }
}

/// Headline shown for each phase
pub fn phase_message(phase: ProcessingPhase) -> &'static str {
    match phase {
        ProcessingPhase::Initial | ProcessingPhase::Initializing => "Initializing...",
        ProcessingPhase::Collecting => "Collecting browser signals...",
        ProcessingPhase::Processing => "Browser signals collected",
        ProcessingPhase::Sending => "Sending to backend...",
        ProcessingPhase::Stored => "Data stored on backend",
        ProcessingPhase::Identifying => "Completing identification...",
        ProcessingPhase::Complete => "Fingerprint Identification Complete",
        ProcessingPhase::Error => "Error:",
    }
}

/// Text rendering of everything a session has measured so far.
///
/// Lines appear only once their phase has been reached, mirroring how the
/// flow fills its record in order.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyPanel {
    pub headline: String,
    pub lines: Vec<(String, String)>,
    pub note: Option<String>,
}

impl LatencyPanel {
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        let record = &snapshot.record;
        let collect = format_latency(record.collect_latency_ms);
        let storage = format_latency(record.backend_storage_latency_ms);
        let line = |label: &str, value: String| (label.to_string(), value);

        let mut headline = phase_message(snapshot.phase).to_string();
        let mut lines = Vec::new();
        let mut note = None;

        match snapshot.phase {
            ProcessingPhase::Initial
            | ProcessingPhase::Initializing
            | ProcessingPhase::Collecting => {}
            ProcessingPhase::Processing => {
                lines.push(line("Signal collection", collect));
                note = Some("Waiting to send data to backend...".to_string());
            }
            ProcessingPhase::Sending => {
                lines.push(line("Signal collection", collect));
            }
            ProcessingPhase::Stored => {
                lines.push(line("Browser signal collection", collect));
                lines.push(line("Backend storage", storage));
                note = Some("Fingerprint identification will be completed on checkout".to_string());
            }
            ProcessingPhase::Identifying => {
                lines.push(line("Browser signal collection", collect));
                lines.push(line("Backend storage", storage));
            }
            ProcessingPhase::Error => {
                let message = snapshot
                    .error
                    .as_deref()
                    .unwrap_or("Failed to process fingerprint data");
                headline = format!("{headline} {message}");
            }
            ProcessingPhase::Complete => {
                lines.push(line("Browser signal collection", collect));
                lines.push(line("Backend data storage", storage));
                lines.push(line(
                    "Fingerprint identification",
                    format_latency(record.identification_latency_ms),
                ));
                lines.push(line(
                    "Total end-to-end latency",
                    format_latency(record.end_to_end_latency_ms()),
                ));
                if let Some(visitor_id) = &record.visitor_id {
                    lines.push(line("Visitor ID", visitor_id.clone()));
                }
                if let Some(request_id) = &record.request_id {
                    lines.push(line("Request ID", request_id.clone()));
                }
                if let Some(verdict) = bot_verdict(record.botd.as_ref()) {
                    lines.push(line("Bot detection", verdict));
                }
            }
        }

        Self {
            headline,
            lines,
            note,
        }
    }
}

/// `botd.bot.result` from the vendor's bot detection product
fn bot_verdict(botd: Option<&serde_json::Value>) -> Option<String> {
    botd?
        .pointer("/bot/result")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

impl fmt::Display for LatencyPanel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.headline)?;
        for (label, value) in &self.lines {
            writeln!(f, "  {label}: {value}")?;
        }
        if let Some(note) = &self.note {
            writeln!(f, "  {note}")?;
        }
        Ok(())
    }
}
