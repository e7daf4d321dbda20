//! Facade used by the HTTP surface and the boot sequence.
//!
//! Resolves per-run resources before handing the record to the launcher:
//! a fresh application port on every start, and a display plus bridge port
//! for persistent instances that keep them across restarts.

use std::sync::Arc;

use aikore_instance::{Instance, InstanceId, InstanceStatus};
use tokio::sync::Mutex;

use crate::blueprint::BlueprintCatalog;
use crate::config::AgentConfig;
use crate::display_alloc::find_free_display;
use crate::error::{InstanceError, Result};
use crate::launcher::{InstanceLauncher, StartReport};
use crate::logs;
use crate::monitor::{BrowserKiosk, HttpProbe, KioskLauncher, ReadinessProbe, StatusMonitor};
use crate::port_alloc::{PortPool, find_ephemeral_port};
use crate::registry::Registry;
use crate::routing::{ReloadRequester, SentinelReload};
use crate::store::{InstanceStore, JsonFileStore, PidUpdate, transition};
use crate::terminal::TerminalSession;

#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub instance: Instance,
    /// Supervised by this agent process.
    pub supervised: bool,
    /// Supervised and the process group leader has not exited.
    pub running: bool,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BootReport {
    pub reset: Vec<InstanceId>,
    pub swept_rules: usize,
    pub autostarted: Vec<InstanceId>,
    pub autostart_failed: Vec<(InstanceId, String)>,
}

pub struct InstanceManager {
    cfg: Arc<AgentConfig>,
    store: Arc<dyn InstanceStore>,
    registry: Registry,
    ports: PortPool,
    catalog: BlueprintCatalog,
    launcher: InstanceLauncher,
    // Serializes start requests from resolution to registration.
    start_lock: Mutex<()>,
}

impl InstanceManager {
    pub fn new(
        cfg: Arc<AgentConfig>,
        store: Arc<dyn InstanceStore>,
        reload: Arc<dyn ReloadRequester>,
        probe: Arc<dyn ReadinessProbe>,
        kiosk: Arc<dyn KioskLauncher>,
    ) -> Self {
        let registry = Registry::new();
        let monitor = StatusMonitor::new(store.clone(), probe, kiosk, cfg.monitor);
        let launcher = InstanceLauncher::new(
            cfg.clone(),
            store.clone(),
            registry.clone(),
            reload,
            monitor,
        );
        Self {
            ports: PortPool::new(cfg.port_range.clone(), store.clone(), registry.clone()),
            catalog: BlueprintCatalog::new(&cfg.stock_blueprints_dir, &cfg.custom_blueprints_dir),
            cfg,
            store,
            registry,
            launcher,
            start_lock: Mutex::new(()),
        }
    }

    /// Production wiring: JSON records, sentinel reloads, HTTP probes, browser kiosk.
    pub fn from_config(cfg: AgentConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn InstanceStore> = Arc::new(JsonFileStore::new(cfg.records_dir()));
        let reload: Arc<dyn ReloadRequester> = Arc::new(SentinelReload::new(&cfg.reload_sentinel));
        let probe: Arc<dyn ReadinessProbe> = Arc::new(HttpProbe::new(cfg.monitor.probe_timeout)?);
        let kiosk: Arc<dyn KioskLauncher> = Arc::new(BrowserKiosk::new(cfg.clone()));
        Ok(Self::new(Arc::new(cfg), store, reload, probe, kiosk))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn catalog(&self) -> &BlueprintCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn get(&self, id: &InstanceId) -> Result<InstanceView> {
        let instance = self.store.get(id).await?;
        let process = self.registry.process(id).await;
        Ok(InstanceView {
            supervised: process.is_some() || self.registry.is_launching(id).await,
            running: process.is_some_and(|p| !p.has_exited()),
            instance,
        })
    }

    pub async fn start(&self, id: &InstanceId) -> Result<StartReport> {
        let _guard = self.start_lock.lock().await;
        if self.registry.contains(id).await {
            return Err(InstanceError::AlreadyRunning(id.clone()));
        }

        let mut inst = self.store.get(id).await?;
        if inst.status == InstanceStatus::Error {
            inst = transition(self.store.as_ref(), id, InstanceStatus::Stopped, PidUpdate::Clear).await?;
        }
        let inst = self.resolve_resources(inst).await?;
        self.launcher.start(&inst).await
    }

    async fn resolve_resources(&self, inst: Instance) -> Result<Instance> {
        let id = inst.id.clone();
        let app_port = find_ephemeral_port()?;

        let mut display_no = inst.display;
        let mut bridge_port = inst.bridge_port;
        let mut heal = false;
        if inst.is_persistent() {
            if inst.desktop_half_allocated() {
                tracing::warn!(
                    instance = %id,
                    display = ?display_no,
                    ?bridge_port,
                    "desktop resources half allocated; reallocating both"
                );
                display_no = None;
                bridge_port = None;
                heal = true;
            }
            if display_no.is_none() && bridge_port.is_none() {
                if heal {
                    self.store
                        .update(
                            &id,
                            Box::new(|inst| {
                                inst.display = None;
                                inst.bridge_port = None;
                                Ok(true)
                            }),
                        )
                        .await?;
                }
                let d = find_free_display(
                    self.store.as_ref(),
                    self.cfg.desktop.display_base,
                    &self.cfg.desktop.x_lock_dir,
                    Some(&id),
                )
                .await?;
                let p = self.ports.claim(&id, None).await?;
                tracing::info!(instance = %id, display = d, bridge_port = p, "desktop resources allocated");
                display_no = Some(d);
                bridge_port = Some(p);
            }
        }

        let (inst, _) = self
            .store
            .update(
                &id,
                Box::new(move |inst| {
                    let before = (inst.port, inst.display, inst.bridge_port);
                    inst.port = Some(app_port);
                    if inst.is_persistent() {
                        inst.display = display_no;
                        inst.bridge_port = bridge_port;
                    }
                    Ok(before != (inst.port, inst.display, inst.bridge_port))
                }),
            )
            .await?;
        Ok(inst)
    }

    /// Waits for any start in flight, so the process it spawns is the one stopped.
    pub async fn stop(&self, id: &InstanceId) -> Result<Instance> {
        let _guard = self.start_lock.lock().await;
        self.launcher.stop(id).await
    }

    /// Stops every supervised instance. Used on agent shutdown.
    pub async fn stop_all(&self) {
        for id in self.registry.ids().await {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!(instance = %id, error = %e, "failed to stop instance on shutdown");
            }
        }
    }

    pub async fn tail_log(&self, id: &InstanceId, max_lines: Option<usize>) -> Result<Vec<String>> {
        let inst = self.store.get(id).await?;
        logs::tail_file(&self.cfg.log_path(&inst.slug()), logs::clamp_lines(max_lines)).await
    }

    pub async fn open_terminal(&self, id: &InstanceId) -> Result<TerminalSession> {
        let inst = self.store.get(id).await?;
        TerminalSession::open(&self.cfg, &self.catalog, &inst).await
    }

    /// Brings persisted state in line with an empty registry after a restart,
    /// then starts instances flagged for autostart.
    pub async fn reconcile_on_boot(&self) -> Result<BootReport> {
        let mut report = BootReport::default();
        let records = self.store.list().await?;

        for inst in &records {
            if inst.status != InstanceStatus::Stopped || inst.pid.is_some() {
                transition(self.store.as_ref(), &inst.id, InstanceStatus::Stopped, PidUpdate::Clear).await?;
                tracing::info!(instance = %inst.id, previous = %inst.status, "reset stale status");
                report.reset.push(inst.id.clone());
            }
            match self.launcher.routing().remove(&inst.slug()).await {
                Ok(true) => report.swept_rules += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(instance = %inst.id, error = %e, "failed to sweep routing rule"),
            }
        }
        if let Err(e) = self.launcher.request_reload().await {
            tracing::warn!(error = %e, "proxy reload request failed");
        }

        for inst in records.iter().filter(|i| i.autostart) {
            match self.start(&inst.id).await {
                Ok(r) => {
                    tracing::info!(instance = %inst.id, pid = r.pid, "autostarted");
                    report.autostarted.push(inst.id.clone());
                }
                Err(e) => {
                    tracing::error!(instance = %inst.id, error = %e, "autostart failed");
                    report.autostart_failed.push((inst.id.clone(), e.to_string()));
                }
            }
        }
        tracing::info!(
            reset = report.reset.len(),
            swept = report.swept_rules,
            autostarted = report.autostarted.len(),
            "boot reconciliation done"
        );
        Ok(report)
    }
}
