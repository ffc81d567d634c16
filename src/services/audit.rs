use crate::services::logger::Logger;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

fn resolve_audit_path() -> PathBuf {
    if let Ok(path) = std::env::var("GATEWAY_AUDIT_FILE") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    std::env::temp_dir().join("sshgate").join("audit.jsonl")
}

#[derive(Debug, Default, Clone)]
pub struct AuditStats {
    pub logged: u64,
    pub errors: u64,
}

/// Append-only JSONL audit trail. Writes are fire-and-forget: a failed
/// append degrades observability but never the request being audited.
#[derive(Clone)]
pub struct AuditService {
    logger: Logger,
    file_path: PathBuf,
    write_lock: Arc<Mutex<()>>,
    stats: Arc<Mutex<AuditStats>>,
}

impl AuditService {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("audit"),
            file_path: resolve_audit_path(),
            write_lock: Arc::new(Mutex::new(())),
            stats: Arc::new(Mutex::new(AuditStats::default())),
        }
    }

    pub fn record(
        &self,
        event: &str,
        subject: Option<&str>,
        outcome: &str,
        details: Value,
    ) {
        let entry = serde_json::json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": event,
            "subject": subject,
            "outcome": outcome,
            "details": details,
        });
        self.append(&entry);
    }

    fn append(&self, entry: &Value) {
        let payload = format!("{}\n", entry);
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .and_then(|mut file| {
                use std::io::Write;
                file.write_all(payload.as_bytes())
            });
        match result {
            Ok(()) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.logged += 1;
                }
            }
            Err(err) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.errors += 1;
                }
                self.logger.warn(
                    "Audit write failed",
                    Some(&serde_json::json!({"error": err.to_string()})),
                );
            }
        }
    }

    pub fn stats(&self) -> Value {
        let stats = self.stats.lock().unwrap_or_else(|err| err.into_inner());
        serde_json::json!({
            "logged": stats.logged,
            "errors": stats.errors,
            "path": self.file_path,
        })
    }
}
