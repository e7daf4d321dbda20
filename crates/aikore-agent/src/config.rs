use std::{
    net::SocketAddr,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 19001..=19099;
const DEFAULT_DISPLAY_BASE: u32 = 10;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn absolutize(p: PathBuf) -> PathBuf {
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };
    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Parses `start-end` (inclusive). Rejects empty or reversed ranges.
pub fn parse_port_range(raw: &str) -> Option<RangeInclusive<u16>> {
    let (a, b) = raw.trim().split_once('-')?;
    let start = a.trim().parse::<u16>().ok()?;
    let end = b.trim().parse::<u16>().ok()?;
    if start == 0 || start > end {
        return None;
    }
    Some(start..=end)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTimings {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Time in `starting` after which the instance is reported as `stalled`.
    pub stall_after: Duration,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(2),
            stall_after: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopConfig {
    pub display_base: u32,
    /// Directory holding X display lock files (`.X<n>-lock`).
    pub x_lock_dir: PathBuf,
    pub display_server: String,
    pub bridge: String,
    pub novnc_dir: PathBuf,
    pub window_manager: String,
    pub kiosk_browser: String,
    pub display_wait_attempts: u32,
    pub display_wait_interval: Duration,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            display_base: DEFAULT_DISPLAY_BASE,
            x_lock_dir: PathBuf::from("/tmp"),
            display_server: "Xvnc".to_string(),
            bridge: "websockify".to_string(),
            novnc_dir: PathBuf::from("/usr/share/novnc"),
            window_manager: "openbox".to_string(),
            kiosk_browser: "firefox".to_string(),
            display_wait_attempts: 50,
            display_wait_interval: Duration::from_millis(200),
        }
    }
}

/// Agent configuration. Every path the supervisor touches is derived from here.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    pub data_root: PathBuf,
    pub stock_blueprints_dir: PathBuf,
    pub custom_blueprints_dir: PathBuf,
    pub routing_dir: PathBuf,
    pub reload_sentinel: PathBuf,
    pub scratch_dir: PathBuf,
    pub conda_root: PathBuf,
    pub port_range: RangeInclusive<u16>,
    pub stop_grace: Duration,
    /// Binary re-invoked as `supervise <plan>` for persistent instances.
    /// `None` means the running executable.
    pub supervisor_bin: Option<PathBuf>,
    pub monitor: MonitorTimings,
    pub desktop: DesktopConfig,
}

impl AgentConfig {
    /// Self-contained layout under `root`, used by tests and local runs.
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8000))),
            stock_blueprints_dir: root.join("blueprints"),
            custom_blueprints_dir: root.join("custom_blueprints"),
            routing_dir: root.join("locations.d"),
            reload_sentinel: root.join("run").join("nginx_reload.flag"),
            scratch_dir: root.join("scratch"),
            conda_root: PathBuf::from("/opt/miniconda3"),
            port_range: DEFAULT_PORT_RANGE,
            stop_grace: Duration::from_secs(10),
            supervisor_bin: None,
            monitor: MonitorTimings::default(),
            desktop: DesktopConfig {
                x_lock_dir: root.join("xlocks"),
                ..DesktopConfig::default()
            },
            data_root: root,
        }
    }

    /// Load configuration from `AIKORE_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_root =
            absolutize(env_path("AIKORE_DATA_ROOT").unwrap_or_else(|| PathBuf::from("./data")));
        let mut cfg = Self::rooted(&data_root);

        if let Some(raw) = env_string("AIKORE_LISTEN_ADDR") {
            cfg.listen_addr = raw
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid AIKORE_LISTEN_ADDR: {raw}"))?;
        }
        if let Some(raw) = env_string("AIKORE_PORT_RANGE") {
            cfg.port_range = parse_port_range(&raw)
                .ok_or_else(|| anyhow::anyhow!("invalid AIKORE_PORT_RANGE: {raw}"))?;
        }

        cfg.stock_blueprints_dir = env_path("AIKORE_BLUEPRINTS_DIR")
            .unwrap_or_else(|| PathBuf::from("/opt/sd-install/blueprints"));
        cfg.custom_blueprints_dir = env_path("AIKORE_CUSTOM_BLUEPRINTS_DIR")
            .unwrap_or_else(|| data_root.join("custom_blueprints"));
        cfg.routing_dir =
            env_path("AIKORE_ROUTING_DIR").unwrap_or_else(|| PathBuf::from("/etc/nginx/locations.d"));
        cfg.reload_sentinel = env_path("AIKORE_RELOAD_SENTINEL")
            .unwrap_or_else(|| PathBuf::from("/run/aikore/nginx_reload.flag"));
        cfg.scratch_dir =
            env_path("AIKORE_SCRATCH_DIR").unwrap_or_else(|| PathBuf::from("/tmp/aikore"));
        if let Some(p) = env_path("AIKORE_CONDA_ROOT") {
            cfg.conda_root = p;
        }
        cfg.supervisor_bin = env_path("AIKORE_SUPERVISOR_BIN");

        cfg.stop_grace = Duration::from_secs(
            env_u64("AIKORE_STOP_GRACE_SEC")
                .map(|v| v.clamp(1, 120))
                .unwrap_or(10),
        );
        cfg.monitor = MonitorTimings {
            poll_interval: Duration::from_millis(
                env_u64("AIKORE_POLL_INTERVAL_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(2000),
            ),
            probe_timeout: Duration::from_millis(
                env_u64("AIKORE_PROBE_TIMEOUT_MS")
                    .map(|v| v.clamp(100, 30_000))
                    .unwrap_or(2000),
            ),
            stall_after: Duration::from_secs(
                env_u64("AIKORE_STALL_THRESHOLD_SEC")
                    .map(|v| v.clamp(5, 24 * 3600))
                    .unwrap_or(120),
            ),
        };

        let d = &mut cfg.desktop;
        d.x_lock_dir = PathBuf::from("/tmp");
        if let Some(v) = env_u64("AIKORE_DISPLAY_BASE") {
            d.display_base = v.clamp(1, 60_000) as u32;
        }
        if let Some(v) = env_string("AIKORE_DISPLAY_SERVER") {
            d.display_server = v;
        }
        if let Some(v) = env_string("AIKORE_DESKTOP_BRIDGE") {
            d.bridge = v;
        }
        if let Some(v) = env_path("AIKORE_NOVNC_DIR") {
            d.novnc_dir = v;
        }
        if let Some(v) = env_string("AIKORE_WINDOW_MANAGER") {
            d.window_manager = v;
        }
        if let Some(v) = env_string("AIKORE_KIOSK_BROWSER") {
            d.kiosk_browser = v;
        }
        if let Some(v) = env_usize("AIKORE_DISPLAY_WAIT_ATTEMPTS") {
            d.display_wait_attempts = v.clamp(1, 1000) as u32;
        }

        Ok(cfg)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_root.join("records")
    }

    /// Per-instance working/config directory (holds `launch.sh` and the output log).
    pub fn instance_dir(&self, slug: &str) -> PathBuf {
        self.data_root.join("instances").join(slug)
    }

    pub fn output_dir(&self, slug: &str) -> PathBuf {
        self.data_root.join("outputs").join(slug)
    }

    pub fn log_path(&self, slug: &str) -> PathBuf {
        self.instance_dir(slug).join("output.log")
    }

    /// Browser profile for the kiosk window of a persistent instance.
    pub fn kiosk_profile_dir(&self, slug: &str) -> PathBuf {
        self.scratch_dir.join(format!("kiosk-{slug}"))
    }
}
