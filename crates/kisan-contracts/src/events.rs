use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Diagnostics log for the dashboard engine: one compact JSON object per
/// line appended to `events.jsonl`.
///
/// Every event carries `type`, `session_id`, and `ts`; the caller payload
/// is merged last and can override those defaults. The file is opened on
/// the first emit and the handle is kept for the writer's lifetime, so
/// clones (the background poller, the foreground shell) funnel through a
/// single serialized sink instead of racing on open/append cycles.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventSink>,
}

#[derive(Debug)]
struct EventSink {
    path: PathBuf,
    session_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventSink {
                path: path.into(),
                session_id: session_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> Result<()> {
        let mut event = EventPayload::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        event.extend(payload);

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut sink = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow!("event sink poisoned"))?;
        if sink.is_none() {
            if let Some(parent) = self.inner.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.inner.path)
                .with_context(|| {
                    format!("failed to open event log {}", self.inner.path.display())
                })?;
            *sink = Some(file);
        }
        if let Some(file) = sink.as_mut() {
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }
}
