use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use aikore_instance::{Instance, InstanceId, InstanceStatus, LaunchMode};
use tokio::{io::AsyncWriteExt, sync::watch};

use crate::blueprint::{BlueprintCatalog, LAUNCH_SCRIPT};
use crate::config::AgentConfig;
use crate::error::{InstanceError, Result};
use crate::launch_plan::{LaunchEnv, LaunchPlan, PLAN_FILE};
use crate::monitor::StatusMonitor;
use crate::process_support::signal_group;
use crate::registry::{ProcessHandle, Registry, RegistryEntry};
use crate::routing::{ReloadRequester, RoutingConfigWriter, public_path};
use crate::store::{InstanceStore, PidUpdate, transition};

const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, serde::Serialize)]
pub struct StartReport {
    pub instance: Instance,
    pub pid: u32,
    pub public_path: String,
    /// Non-fatal problems, e.g. a failed proxy reload.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Starts and stops instance processes.
///
/// Expects resources (application port, and display plus bridge port in
/// persistent mode) to be resolved on the record before `start`.
#[derive(Clone)]
pub struct InstanceLauncher {
    cfg: Arc<AgentConfig>,
    store: Arc<dyn InstanceStore>,
    registry: Registry,
    catalog: BlueprintCatalog,
    routing: RoutingConfigWriter,
    reload: Arc<dyn ReloadRequester>,
    monitor: StatusMonitor,
}

struct Spawned {
    pid: u32,
    process: ProcessHandle,
}

impl InstanceLauncher {
    pub fn new(
        cfg: Arc<AgentConfig>,
        store: Arc<dyn InstanceStore>,
        registry: Registry,
        reload: Arc<dyn ReloadRequester>,
        monitor: StatusMonitor,
    ) -> Self {
        Self {
            catalog: BlueprintCatalog::new(&cfg.stock_blueprints_dir, &cfg.custom_blueprints_dir),
            routing: RoutingConfigWriter::new(&cfg.routing_dir),
            cfg,
            store,
            registry,
            reload,
            monitor,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn routing(&self) -> &RoutingConfigWriter {
        &self.routing
    }

    pub async fn request_reload(&self) -> Result<()> {
        self.reload.request_reload().await
    }

    pub async fn start(&self, inst: &Instance) -> Result<StartReport> {
        self.registry.reserve(&inst.id).await?;
        let res = self.launch(inst).await;
        if res.is_err() {
            self.registry.release(&inst.id).await;
        }
        res
    }

    async fn launch(&self, inst: &Instance) -> Result<StartReport> {
        if inst.status != InstanceStatus::Stopped {
            return Err(InstanceError::IllegalTransition {
                from: inst.status,
                to: InstanceStatus::Starting,
            });
        }
        let id = &inst.id;
        let slug = inst.slug();
        let mut warnings = Vec::new();

        if inst.is_persistent() && inst.desktop().is_none() {
            transition(self.store.as_ref(), id, InstanceStatus::Stopped, PidUpdate::Clear).await?;
            return Err(InstanceError::Configuration(format!(
                "persistent instance {} has no display or bridge port allocated",
                inst.name
            )));
        }

        let mut rule_written = false;
        let spawned = match self.prepare_and_spawn(inst, &slug, &mut rule_written, &mut warnings).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(instance = %id, error = %e, "launch failed before the process started");
                self.fail_before_spawn(id, &slug, rule_written).await;
                return Err(e);
            }
        };

        let updated = match transition(
            self.store.as_ref(),
            id,
            InstanceStatus::Starting,
            PidUpdate::Set(spawned.pid),
        )
        .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(instance = %id, error = %e, "failed to record start; killing process");
                let _ = signal_group(spawned.process.pgid(), libc::SIGKILL);
                spawned.process.wait_exit(KILL_WAIT).await;
                self.fail_before_spawn(id, &slug, rule_written).await;
                return Err(e);
            }
        };

        let app_port = inst.port.unwrap_or_default();
        let watcher = self
            .monitor
            .spawn(id.clone(), app_port, inst.is_persistent(), spawned.process.clone());
        self.registry
            .activate(
                id,
                RegistryEntry {
                    process: spawned.process,
                    watcher,
                    ports: inst.claimed_ports().collect(),
                },
            )
            .await?;

        tracing::info!(
            instance = %id,
            name = %inst.name,
            pid = spawned.pid,
            port = app_port,
            mode = ?inst.mode,
            "instance started"
        );
        Ok(StartReport {
            instance: updated,
            pid: spawned.pid,
            public_path: public_path(&slug),
            warnings,
        })
    }

    async fn prepare_and_spawn(
        &self,
        inst: &Instance,
        slug: &str,
        rule_written: &mut bool,
        warnings: &mut Vec<String>,
    ) -> Result<Spawned> {
        let app_port = inst.port.ok_or_else(|| {
            InstanceError::Configuration(format!("instance {} has no application port", inst.name))
        })?;
        if slug.is_empty() {
            return Err(InstanceError::Configuration(format!(
                "instance name {:?} has no routable characters",
                inst.name
            )));
        }

        let conf_dir = self.cfg.instance_dir(slug);
        tokio::fs::create_dir_all(&conf_dir).await?;
        tokio::fs::create_dir_all(self.cfg.output_dir(slug)).await?;
        self.catalog.materialize(&inst.blueprint, &conf_dir).await?;

        let env = LaunchEnv::for_instance(inst, &self.cfg, app_port);
        let (program, args, target_port) = match (inst.mode, inst.desktop()) {
            (LaunchMode::Persistent, Some((display, bridge_port))) => {
                let plan = LaunchPlan::persistent(&self.cfg.desktop, display, bridge_port, &conf_dir);
                let plan_path = conf_dir.join(PLAN_FILE);
                plan.write(&plan_path).await?;
                let program = self.supervisor_program()?;
                let args = vec!["supervise".to_string(), plan_path.display().to_string()];
                (program, args, bridge_port)
            }
            (LaunchMode::Persistent, None) => {
                return Err(InstanceError::Configuration(
                    "desktop resources are not allocated".to_string(),
                ));
            }
            (LaunchMode::Direct, _) => (
                PathBuf::from("bash"),
                vec![LAUNCH_SCRIPT.to_string()],
                app_port,
            ),
        };

        self.routing.write(slug, inst.mode, target_port).await?;
        *rule_written = true;
        if let Err(e) = self.reload.request_reload().await {
            tracing::warn!(instance = %inst.id, error = %e, "proxy reload request failed");
            warnings.push(e.to_string());
        }

        let log_path = self.cfg.log_path(slug);
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        log.write_all(
            format!(
                "[aikore] {} starting {} ({:?} mode, port {})\n",
                chrono::Utc::now().to_rfc3339(),
                inst.blueprint,
                inst.mode,
                app_port
            )
            .as_bytes(),
        )
        .await?;
        let log = log.into_std().await;
        let log_err = log.try_clone()?;

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .current_dir(&conf_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);
        env.apply(&mut cmd);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(InstanceError::Spawn)?;
        let pid = child.id().ok_or_else(|| {
            InstanceError::Spawn(std::io::Error::other("process exited before its pid was read"))
        })?;

        let (exit_tx, exit_rx) = watch::channel(false);
        let id = inst.id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(instance = %id, pid, %status, "instance process exited"),
                Err(e) => tracing::warn!(instance = %id, pid, error = %e, "failed to wait for instance process"),
            }
            let _ = exit_tx.send(true);
        });

        Ok(Spawned {
            pid,
            process: ProcessHandle::new(pid, exit_rx),
        })
    }

    fn supervisor_program(&self) -> Result<PathBuf> {
        match &self.cfg.supervisor_bin {
            Some(p) => Ok(p.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    async fn fail_before_spawn(&self, id: &InstanceId, slug: &str, rule_written: bool) {
        if rule_written {
            match self.routing.remove(slug).await {
                Ok(true) => {
                    if let Err(e) = self.reload.request_reload().await {
                        tracing::warn!(instance = %id, error = %e, "proxy reload request failed");
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(instance = %id, error = %e, "failed to remove routing rule"),
            }
        }
        if let Err(e) = transition(self.store.as_ref(), id, InstanceStatus::Error, PidUpdate::Clear).await {
            tracing::warn!(instance = %id, error = %e, "failed to record launch error");
        }
    }

    /// Stops the instance. Idempotent: an unsupervised instance is only
    /// cleaned up and marked `stopped`.
    pub async fn stop(&self, id: &InstanceId) -> Result<Instance> {
        let inst = self.store.get(id).await?;
        let slug = inst.slug();

        match self.registry.remove(id).await {
            Some(entry) => {
                entry.watcher.cancel_and_wait().await;
                self.terminate(id, &entry.process).await;
            }
            None => {
                tracing::info!(instance = %id, "instance not supervised; skipping signals");
            }
        }

        match self.routing.remove(&slug).await {
            Ok(true) => {
                if let Err(e) = self.reload.request_reload().await {
                    tracing::warn!(instance = %id, error = %e, "proxy reload request failed");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(instance = %id, error = %e, "failed to remove routing rule"),
        }
        if inst.is_persistent() {
            let profile = self.cfg.kiosk_profile_dir(&slug);
            match tokio::fs::remove_dir_all(&profile).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(instance = %id, path = %profile.display(), error = %e, "failed to remove kiosk profile"),
            }
        }

        let stopped = transition(self.store.as_ref(), id, InstanceStatus::Stopped, PidUpdate::Clear).await?;
        tracing::info!(instance = %id, name = %inst.name, "instance stopped");
        Ok(stopped)
    }

    async fn terminate(&self, id: &InstanceId, process: &ProcessHandle) {
        let pgid = process.pgid();
        if process.has_exited() {
            // The leader is gone; sweep whatever it left in its group.
            let _ = signal_group(pgid, libc::SIGKILL);
            return;
        }
        if let Err(e) = signal_group(pgid, libc::SIGTERM) {
            tracing::warn!(instance = %id, pgid, error = %e, "SIGTERM failed");
        }
        if process.wait_exit(self.cfg.stop_grace).await {
            let _ = signal_group(pgid, libc::SIGKILL);
            return;
        }
        tracing::warn!(instance = %id, pgid, grace_secs = self.cfg.stop_grace.as_secs(), "escalating to SIGKILL");
        if let Err(e) = signal_group(pgid, libc::SIGKILL) {
            tracing::warn!(instance = %id, pgid, error = %e, "SIGKILL failed");
        }
        if !process.wait_exit(KILL_WAIT).await {
            tracing::error!(instance = %id, pid = process.pid, "process survived SIGKILL");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{KioskLauncher, ProbeOutcome, ReadinessProbe};
    use crate::routing::SentinelReload;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NeverReady;

    #[async_trait]
    impl ReadinessProbe for NeverReady {
        async fn probe(&self, _port: u16) -> ProbeOutcome {
            ProbeOutcome::NotReady
        }
    }

    struct NoKiosk;

    #[async_trait]
    impl KioskLauncher for NoKiosk {
        async fn launch(&self, _inst: &Instance, _port: u16, _pgid: i32) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        cfg: Arc<AgentConfig>,
        store: Arc<MemoryStore>,
        launcher: InstanceLauncher,
    }

    struct FailingReload;

    #[async_trait]
    impl ReloadRequester for FailingReload {
        async fn request_reload(&self) -> Result<()> {
            Err(InstanceError::Reload(std::io::Error::other("proxy supervisor unreachable")))
        }
    }

    fn harness() -> Harness {
        harness_with(|cfg| Arc::new(SentinelReload::new(&cfg.reload_sentinel)))
    }

    fn harness_with(reload: impl FnOnce(&AgentConfig) -> Arc<dyn ReloadRequester>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig::rooted(dir.path());
        cfg.stop_grace = Duration::from_secs(3);
        std::fs::create_dir_all(&cfg.stock_blueprints_dir).unwrap();
        std::fs::write(
            cfg.stock_blueprints_dir.join("sleepy.sh"),
            "#!/bin/bash\nenv > env.txt\nexec sleep 30\n",
        )
        .unwrap();
        let cfg = Arc::new(cfg);
        let store = Arc::new(MemoryStore::new());
        let monitor = StatusMonitor::new(
            store.clone(),
            Arc::new(NeverReady),
            Arc::new(NoKiosk),
            cfg.monitor,
        );
        let launcher = InstanceLauncher::new(
            cfg.clone(),
            store.clone(),
            Registry::new(),
            reload(&cfg),
            monitor,
        );
        Harness {
            _dir: dir,
            cfg,
            store,
            launcher,
        }
    }

    async fn seeded(h: &Harness, blueprint: &str) -> Instance {
        let mut inst = Instance::new("Sleepy One", blueprint);
        inst.port = Some(40111);
        h.store.insert(inst.clone()).await;
        inst
    }

    #[tokio::test]
    async fn start_then_stop_direct_instance() {
        let h = harness();
        let inst = seeded(&h, "sleepy.sh").await;

        let report = h.launcher.start(&inst).await.unwrap();
        assert_eq!(report.public_path, "/app/sleepy-one/");
        assert_eq!(report.instance.status, InstanceStatus::Starting);
        assert_eq!(report.instance.pid, Some(report.pid));
        assert!(h.launcher.registry().contains(&inst.id).await);
        assert!(h.cfg.routing_dir.join("sleepy-one.conf").exists());
        assert!(h.cfg.reload_sentinel.exists());

        let env_file = h.cfg.instance_dir("sleepy-one").join("env.txt");
        for _ in 0..50 {
            if env_file.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let env = std::fs::read_to_string(&env_file).unwrap();
        assert!(env.contains("WEBUI_PORT=40111"));
        assert!(env.contains("INSTANCE_NAME=Sleepy One"));
        assert!(env.contains("BLUEPRINT_ID=sleepy.sh"));

        let dup = h.launcher.start(&report.instance).await.unwrap_err();
        assert!(matches!(dup, InstanceError::AlreadyRunning(_)));

        let stopped = h.launcher.stop(&inst.id).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert_eq!(stopped.pid, None);
        assert!(!h.launcher.registry().contains(&inst.id).await);
        assert!(!h.cfg.routing_dir.join("sleepy-one.conf").exists());
        assert!(!crate::process_support::pid_alive(report.pid));

        let log = std::fs::read_to_string(h.cfg.log_path("sleepy-one")).unwrap();
        assert!(log.contains("[aikore]"));
    }

    #[tokio::test]
    async fn failed_reload_is_a_warning_not_a_failure() {
        let h = harness_with(|_| Arc::new(FailingReload));
        let inst = seeded(&h, "sleepy.sh").await;

        let report = h.launcher.start(&inst).await.unwrap();
        assert_eq!(report.instance.status, InstanceStatus::Starting);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("proxy supervisor unreachable"));
        assert!(h.cfg.routing_dir.join("sleepy-one.conf").exists());
        assert!(h.launcher.registry().contains(&inst.id).await);

        let stopped = h.launcher.stop(&inst.id).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert!(!h.cfg.routing_dir.join("sleepy-one.conf").exists());
    }

    #[tokio::test]
    async fn missing_blueprint_marks_error_without_routing() {
        let h = harness();
        let inst = seeded(&h, "nope.sh").await;

        let err = h.launcher.start(&inst).await.unwrap_err();
        assert!(matches!(err, InstanceError::BlueprintNotFound { .. }));
        assert_eq!(h.store.get(&inst.id).await.unwrap().status, InstanceStatus::Error);
        assert!(!h.launcher.registry().contains(&inst.id).await);
        assert!(!h.cfg.routing_dir.join("sleepy-one.conf").exists());
    }

    #[tokio::test]
    async fn persistent_start_requires_desktop_resources() {
        let h = harness();
        let mut inst = Instance::new("desk", "sleepy.sh");
        inst.mode = LaunchMode::Persistent;
        inst.port = Some(40112);
        inst.display = Some(10);
        h.store.insert(inst.clone()).await;

        let err = h.launcher.start(&inst).await.unwrap_err();
        assert!(matches!(err, InstanceError::Configuration(_)));
        let stored = h.store.get(&inst.id).await.unwrap();
        assert_eq!(stored.status, InstanceStatus::Stopped);
        assert!(!h.launcher.registry().contains(&inst.id).await);
    }

    #[tokio::test]
    async fn stop_of_a_dead_process_is_clean() {
        let h = harness();
        let mut inst = seeded(&h, "sleepy.sh").await;
        inst.status = InstanceStatus::Started;
        inst.pid = Some(4_000_000);
        h.store.insert(inst.clone()).await;

        let (_tx, rx) = watch::channel(true);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        });
        h.launcher.registry().reserve(&inst.id).await.unwrap();
        h.launcher
            .registry()
            .activate(
                &inst.id,
                RegistryEntry {
                    process: ProcessHandle::new(4_000_000, rx),
                    watcher: crate::registry::WatcherHandle::new(cancel, task),
                    ports: vec![40111],
                },
            )
            .await
            .unwrap();

        let stopped = h.launcher.stop(&inst.id).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert_eq!(stopped.pid, None);
        assert!(!h.launcher.registry().contains(&inst.id).await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness();
        let inst = seeded(&h, "sleepy.sh").await;
        for _ in 0..2 {
            let stopped = h.launcher.stop(&inst.id).await.unwrap();
            assert_eq!(stopped.status, InstanceStatus::Stopped);
        }
    }
}
