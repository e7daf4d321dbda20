use std::fmt;

/// Stable identity of a persisted instance record.
///
/// Records are owned by the CRUD layer; the supervisor only ever refers to them by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// The workload serves HTTP itself and is proxied directly.
    #[default]
    Direct,
    /// The workload runs inside a virtual desktop reached through a websocket bridge.
    Persistent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    /// Readiness has not been reached in time. Not terminal.
    Stalled,
    Error,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Started => "started",
            InstanceStatus::Stalled => "stalled",
            InstanceStatus::Error => "error",
        }
    }

    /// Transition table for persisted status.
    ///
    /// `stopped -> stopped` is accepted so that stop stays idempotent.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Started)
                | (Starting, Stalled)
                | (Stalled, Started)
                | (Starting | Started | Stalled | Error, Stopped)
                | (Stopped, Error)
                | (Stopped, Stopped)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted instance record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    /// Blueprint script file name, e.g. `ComfyUI.sh`.
    pub blueprint: String,
    #[serde(default)]
    pub gpu_ids: Option<String>,
    #[serde(default)]
    pub mode: LaunchMode,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub bridge_port: Option<u16>,
    #[serde(default)]
    pub display: Option<u32>,
}

impl Instance {
    pub fn new(name: impl Into<String>, blueprint: impl Into<String>) -> Self {
        Self {
            id: InstanceId::new(),
            name: name.into(),
            blueprint: blueprint.into(),
            gpu_ids: None,
            mode: LaunchMode::Direct,
            autostart: false,
            status: InstanceStatus::Stopped,
            pid: None,
            port: None,
            bridge_port: None,
            display: None,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.mode == LaunchMode::Persistent
    }

    /// Filesystem and URL safe form of the instance name.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    /// Display and bridge port of a persistent instance, if both are allocated.
    pub fn desktop(&self) -> Option<(u32, u16)> {
        match (self.display, self.bridge_port) {
            (Some(d), Some(p)) => Some((d, p)),
            _ => None,
        }
    }

    /// Exactly one of display/bridge port is set.
    pub fn desktop_half_allocated(&self) -> bool {
        self.display.is_some() != self.bridge_port.is_some()
    }

    /// Ports recorded on this instance, used to detect conflicts in the pool.
    pub fn claimed_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.port.into_iter().chain(self.bridge_port)
    }
}

/// Lower-case, collapse every run of non-alphanumerics into one hyphen, trim hyphens.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}
