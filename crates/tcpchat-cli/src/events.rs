use serde::Serialize;
use std::io::Write;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

/// RFC 3339 local timestamp for JSONL events.
pub fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub name: String,
    pub mode: String,
    pub endpoint: Option<String>,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(name: &str, mode: &str, endpoint: Option<String>) -> Self {
        Self {
            event: "started",
            name: name.to_string(),
            mode: mode.to_string(),
            endpoint,
            timestamp: now_iso(),
        }
    }
}

#[derive(Serialize)]
pub struct EventStatus {
    pub event: &'static str,
    pub available: bool,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventError {
    pub event: &'static str,
    pub message: String,
    pub cause: Option<String>,
    pub elapsed_s: f64,
}

// ── Link events ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventConnected {
    pub event: &'static str,
    pub peer: String,
    pub local: String,
    pub direction: &'static str,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventClosed {
    pub event: &'static str,
    pub peer: String,
    pub reason: String,
    pub elapsed_s: f64,
}

// ── Chat events ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventProfile {
    pub event: &'static str,
    pub peer: String,
    pub username: String,
}

#[derive(Serialize)]
pub struct EventMessage {
    pub event: &'static str,
    pub peer: String,
    pub from: String,
    pub content: String,
    pub time: Option<String>,
}

#[derive(Serialize)]
pub struct EventText {
    pub event: &'static str,
    pub peer: String,
    pub text: String,
}

#[derive(Serialize)]
pub struct EventSent {
    pub event: &'static str,
    pub content: String,
    pub peers: usize,
    pub timestamp: String,
}

// ── Summary ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventSummary {
    pub event: &'static str,
    pub mode: String,
    pub links: u64,
    pub received: u64,
    pub sent: u64,
    pub elapsed_s: f64,
}
