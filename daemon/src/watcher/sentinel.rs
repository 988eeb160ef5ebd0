//! Sentinel file names, payloads and event classification.

use devscope_shared::{DeployMode, DeviceId};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentinelKind {
    Start,
    Stop,
    Beat,
    Uuid,
    /// Same effect as `Stop`.
    Done,
}

impl SentinelKind {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "start" => Some(SentinelKind::Start),
            "stop" => Some(SentinelKind::Stop),
            "beat" => Some(SentinelKind::Beat),
            "uuid" => Some(SentinelKind::Uuid),
            "done" => Some(SentinelKind::Done),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SentinelKind::Start => "start",
            SentinelKind::Stop => "stop",
            SentinelKind::Beat => "beat",
            SentinelKind::Uuid => "uuid",
            SentinelKind::Done => "done",
        }
    }
}

impl fmt::Display for SentinelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a sentinel path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Created, or renamed into place.
    Created,
    Written,
    /// Closed after writing; the contents are complete.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelEvent {
    pub job_id: String,
    pub kind: SentinelKind,
    pub trigger: Trigger,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    /// No `_<kind>` suffix at all.
    Malformed,
    /// A suffix that is not a sentinel kind.
    UnknownKind(String),
}

/// Split `<jobId>_<kind>`. The job id may itself contain underscores.
pub fn parse_sentinel_name(name: &str) -> Result<(String, SentinelKind), NameError> {
    let (job_id, suffix) = name.rsplit_once('_').ok_or(NameError::Malformed)?;
    if job_id.is_empty() {
        return Err(NameError::Malformed);
    }
    let kind =
        SentinelKind::from_suffix(suffix).ok_or_else(|| NameError::UnknownKind(suffix.to_string()))?;
    Ok((job_id.to_string(), kind))
}

pub fn sentinel_name(job_id: &str, kind: SentinelKind) -> String {
    format!("{}_{}", job_id, kind)
}

/// Name of the file start results are written to.
pub fn status_file_name(job_id: &str) -> String {
    format!("{}_status", job_id)
}

pub fn classify(kind: &EventKind) -> Option<Trigger> {
    match kind {
        EventKind::Create(_) => Some(Trigger::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(Trigger::Created),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            Some(Trigger::Written)
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(Trigger::Closed),
        _ => None,
    }
}

/// Sentinel events in one notify event, plus paths that did not parse.
pub fn sentinel_events(event: &Event) -> (Vec<SentinelEvent>, Vec<(PathBuf, NameError)>) {
    let mut events = Vec::new();
    let mut rejected = Vec::new();
    let trigger = match classify(&event.kind) {
        Some(trigger) => trigger,
        None => return (events, rejected),
    };

    for path in &event.paths {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => {
                rejected.push((path.clone(), NameError::Malformed));
                continue;
            }
        };
        match parse_sentinel_name(name) {
            Ok((job_id, kind)) => events.push(SentinelEvent {
                job_id,
                kind,
                trigger,
                path: path.clone(),
            }),
            Err(e) => rejected.push((path.clone(), e)),
        }
    }
    (events, rejected)
}

/// Contents of a `<jobId>_start` file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartPayload {
    pub device_id: DeviceId,

    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub mode: Option<DeployMode>,
}

impl StartPayload {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Configuration flattened to strings; non-string JSON values keep their
    /// JSON text.
    pub fn string_config(&self) -> BTreeMap<String, String> {
        self.config
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}
