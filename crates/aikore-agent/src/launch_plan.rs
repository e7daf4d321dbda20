use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use aikore_instance::Instance;
use serde::{Deserialize, Serialize};

use crate::blueprint::LAUNCH_SCRIPT;
use crate::config::{AgentConfig, DesktopConfig};
use crate::error::Result;
use crate::store::write_json_atomic;

/// File name of the serialized plan inside the instance directory.
pub const PLAN_FILE: &str = "launch-plan.json";

/// VNC servers listen on `5900 + display`.
pub fn vnc_port(display: u32) -> u16 {
    5900u32.saturating_add(display).min(u16::MAX as u32) as u16
}

/// Environment passed to every workload process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnv {
    vars: BTreeMap<String, String>,
}

impl LaunchEnv {
    pub fn for_instance(inst: &Instance, cfg: &AgentConfig, app_port: u16) -> Self {
        let slug = inst.slug();
        let mut vars = BTreeMap::new();
        vars.insert("INSTANCE_NAME".to_string(), inst.name.clone());
        vars.insert(
            "INSTANCE_CONF_DIR".to_string(),
            cfg.instance_dir(&slug).display().to_string(),
        );
        vars.insert(
            "INSTANCE_OUTPUT_DIR".to_string(),
            cfg.output_dir(&slug).display().to_string(),
        );
        vars.insert("WEBUI_PORT".to_string(), app_port.to_string());
        vars.insert("BLUEPRINT_ID".to_string(), inst.blueprint.clone());
        if let Some(gpus) = inst.gpu_ids.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
            vars.insert("CUDA_VISIBLE_DEVICES".to_string(), gpus.to_string());
            vars.insert("NVIDIA_VISIBLE_DEVICES".to_string(), gpus.to_string());
        }
        if inst.is_persistent()
            && let Some(display) = inst.display
        {
            vars.insert("DISPLAY".to_string(), format!(":{display}"));
        }
        Self { vars }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        cmd.envs(&self.vars);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchStep {
    /// Start a long-running process and keep it.
    Spawn {
        name: String,
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Poll a local TCP port until it accepts connections.
    /// Fails early if the `guard` process has exited.
    WaitForPort {
        port: u16,
        attempts: u32,
        interval_ms: u64,
        #[serde(default)]
        guard: Option<String>,
    },
    /// Run a command to completion.
    Run {
        name: String,
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        best_effort: bool,
    },
}

impl LaunchStep {
    pub fn name(&self) -> &str {
        match self {
            LaunchStep::Spawn { name, .. } | LaunchStep::Run { name, .. } => name,
            LaunchStep::WaitForPort { .. } => "wait-for-port",
        }
    }
}

/// Ordered steps executed by `aikore-agent supervise <plan>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub workdir: PathBuf,
    pub steps: Vec<LaunchStep>,
}

impl LaunchPlan {
    /// Desktop stack for a persistent instance, workload last.
    pub fn persistent(
        desktop: &DesktopConfig,
        display: u32,
        bridge_port: u16,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        let rfb = vnc_port(display);
        let steps = vec![
            LaunchStep::Spawn {
                name: "display".to_string(),
                program: desktop.display_server.clone(),
                args: vec![
                    format!(":{display}"),
                    "-rfbport".to_string(),
                    rfb.to_string(),
                    "-SecurityTypes".to_string(),
                    "None".to_string(),
                ],
            },
            LaunchStep::WaitForPort {
                port: rfb,
                attempts: desktop.display_wait_attempts,
                interval_ms: desktop.display_wait_interval.as_millis() as u64,
                guard: Some("display".to_string()),
            },
            LaunchStep::Spawn {
                name: "bridge".to_string(),
                program: desktop.bridge.clone(),
                args: vec![
                    "--web".to_string(),
                    desktop.novnc_dir.display().to_string(),
                    bridge_port.to_string(),
                    format!("127.0.0.1:{rfb}"),
                ],
            },
            LaunchStep::Run {
                name: "no-blanking".to_string(),
                program: "xset".to_string(),
                args: ["s", "off", "-dpms", "s", "noblank"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                best_effort: true,
            },
            LaunchStep::Spawn {
                name: "window-manager".to_string(),
                program: desktop.window_manager.clone(),
                args: Vec::new(),
            },
            LaunchStep::Spawn {
                name: "workload".to_string(),
                program: "bash".to_string(),
                args: vec![LAUNCH_SCRIPT.to_string()],
            },
        ];
        Self {
            workdir: workdir.into(),
            steps,
        }
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        write_json_atomic(dir, path, self).await
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
