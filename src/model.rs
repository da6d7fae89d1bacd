use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Default interval between status polls while a run is executing.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// File name used on the server for a requested Baclava output bundle.
pub const DEFAULT_BUNDLE_OUTPUT: &str = "out.xml";

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// HTTP basic credentials attached to every server call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Server-owned run state. Ordered by lifecycle rank; the two terminal
/// states share a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Running,
    Finished,
    Stopped,
}

impl RunStatus {
    fn rank(self) -> u8 {
        match self {
            RunStatus::Created => 0,
            RunStatus::Running => 1,
            RunStatus::Finished | RunStatus::Stopped => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// True when moving from `self` to `next` would go backwards.
    pub fn regresses_to(self, next: RunStatus) -> bool {
        next.rank() < self.rank() || (self.is_terminal() && next != self)
    }

    /// Name used by the server's `status` resource.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            RunStatus::Created => "Initialized",
            RunStatus::Running => "Operating",
            RunStatus::Finished => "Finished",
            RunStatus::Stopped => "Stopped",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Initialized" => Ok(RunStatus::Created),
            "Operating" => Ok(RunStatus::Running),
            "Finished" => Ok(RunStatus::Finished),
            "Stopped" => Ok(RunStatus::Stopped),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPortInfo {
    pub name: String,
    pub depth: usize,
    pub is_set: bool,
}

/// Where an input port's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Value(String),
    File(PathBuf),
}

/// Inputs for a new run. A bundle, when present, replaces every per-port entry.
#[derive(Debug, Clone, Default)]
pub struct InputPlan {
    pub bundle: Option<PathBuf>,
    pub ports: BTreeMap<String, InputSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Ports,
    Bundle,
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub workflow: Bytes,
    pub inputs: InputPlan,
    pub output_mode: OutputMode,
    pub delete_after: bool,
}

/// A single resolved leaf of an output port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortValue {
    Inline {
        content_type: String,
        #[serde(serialize_with = "serialize_lossy")]
        data: Bytes,
    },
    Reference {
        uri: String,
        content_type: String,
        size: u64,
    },
    Error {
        message: String,
    },
}

impl PortValue {
    /// Payload size in bytes; error markers carry no payload.
    pub fn size(&self) -> u64 {
        match self {
            PortValue::Inline { data, .. } => data.len() as u64,
            PortValue::Reference { size, .. } => *size,
            PortValue::Error { .. } => 0,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            PortValue::Inline { content_type, .. } | PortValue::Reference { content_type, .. } => {
                Some(content_type)
            }
            PortValue::Error { .. } => None,
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            PortValue::Reference { uri, .. } => Some(uri),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PortValue::Error { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            PortValue::Error { message } => Some(message),
            _ => None,
        }
    }

    /// Inline payload as text, if it is inline and valid UTF-8.
    pub fn string_data(&self) -> Option<&str> {
        match self {
            PortValue::Inline { data, .. } => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }
}

fn serialize_lossy<S: Serializer>(data: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(data))
}

/// Value tree of an output port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PortData {
    Value(PortValue),
    List(Vec<PortData>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputPort {
    pub name: String,
    pub depth: usize,
    pub data: PortData,
}

/// Outcome of waiting for a run to leave the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished(RunStatus),
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectedOutputs {
    Ports {
        ports: Vec<OutputPort>,
    },
    Bundle {
        size: u64,
        #[serde(skip)]
        data: Bytes,
    },
    /// The run did not exit cleanly, so nothing was fetched.
    NotCollected,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: String,
    pub status: RunStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub outputs: CollectedOutputs,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    // Box to keep the enum small; the report holds output trees.
    Completed(Box<RunReport>),
    /// `deleted` is set when the run was cancelled before it started.
    Cancelled { id: String, deleted: bool },
}

/// Structured progress events emitted by the driver and consumed by CLI layers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Created {
        id: String,
        created_at: Option<OffsetDateTime>,
    },
    BundleUploaded {
        path: PathBuf,
    },
    InputSet {
        port: String,
        value: String,
    },
    InputFileSet {
        port: String,
        file_name: String,
    },
    InputIgnored {
        port: String,
    },
    BundleOutputRequested,
    Started {
        started_at: Option<OffsetDateTime>,
    },
    Polled {
        status: RunStatus,
    },
    Finished {
        status: RunStatus,
        finished_at: Option<OffsetDateTime>,
    },
    Collected {
        report: Box<RunReport>,
    },
    Deleted {
        id: String,
    },
}
