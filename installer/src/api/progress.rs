// Progress events
//
// Callers supply an emitter; every phase of the pipeline reports through it. Payloads are
// serialized in camelCase so a GUI or a log shipper can consume them unchanged.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

pub type ProgressEmitter = Arc<dyn Fn(ProgressPayload) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub correlation_id: String,
    pub step: String,
    pub severity: String, // "info" | "warn" | "error"
    pub phase: String,
    pub percent: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u128>,
}

/// Emitter bound to one run (correlation id + start time).
#[derive(Clone)]
pub struct ProgressReporter {
    correlation_id: String,
    started: Instant,
    emitter: Option<ProgressEmitter>,
}

impl ProgressReporter {
    pub fn new(correlation_id: impl Into<String>, emitter: Option<ProgressEmitter>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            started: Instant::now(),
            emitter,
        }
    }

    pub fn silent() -> Self {
        Self::new("silent", None)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    fn send(&self, severity: &str, phase: &str, step: &str, percent: i32, message: String) {
        if let Some(emit) = &self.emitter {
            emit(ProgressPayload {
                correlation_id: self.correlation_id.clone(),
                step: step.to_string(),
                severity: severity.to_string(),
                phase: phase.to_string(),
                percent: percent.clamp(0, 100),
                message,
                elapsed_ms: Some(self.started.elapsed().as_millis()),
            });
        }
    }

    pub fn info(&self, phase: &str, step: &str, percent: i32, message: impl Into<String>) {
        self.send("info", phase, step, percent, message.into());
    }

    pub fn warn(&self, phase: &str, step: &str, percent: i32, message: impl Into<String>) {
        self.send("warn", phase, step, percent, message.into());
    }

    pub fn error(&self, phase: &str, step: &str, percent: i32, message: impl Into<String>) {
        self.send("error", phase, step, percent, message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn payloads_carry_correlation_id_and_clamped_percent() {
        let seen: Arc<Mutex<Vec<ProgressPayload>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let emitter: ProgressEmitter = Arc::new(move |p| sink.lock().unwrap().push(p));
        let progress = ProgressReporter::new("run-42", Some(emitter));

        progress.info("startup", "tier", 140, "tier data ready");
        progress.warn("ports", "resolve", 20, "moved");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].correlation_id, "run-42");
        assert_eq!(seen[0].percent, 100);
        assert_eq!(seen[1].severity, "warn");

        let json = serde_json::to_value(&seen[0]).unwrap();
        assert_eq!(json["correlationId"], "run-42");
        assert!(json.get("elapsedMs").is_some());
    }

    #[test]
    fn silent_reporter_drops_events() {
        ProgressReporter::silent().error("x", "y", 0, "nothing listens");
    }
}
