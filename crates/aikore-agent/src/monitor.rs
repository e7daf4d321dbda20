use std::{process::Stdio, sync::Arc, time::Duration};

use aikore_instance::{Instance, InstanceId, InstanceStatus};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, MonitorTimings};
use crate::registry::{ProcessHandle, WatcherHandle};
use crate::store::{InstanceStore, compare_and_set_status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    NotReady,
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, port: u16) -> ProbeOutcome;
}

/// `GET http://127.0.0.1:<port>/`. Any status below 500 counts as ready.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, port: u16) -> ProbeOutcome {
        match self
            .client
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .await
        {
            Ok(resp) if resp.status().as_u16() < 500 => ProbeOutcome::Ready,
            Ok(resp) => {
                tracing::trace!(port, status = %resp.status(), "probe: server error");
                ProbeOutcome::NotReady
            }
            Err(e) => {
                tracing::trace!(port, error = %e, "probe: not reachable");
                ProbeOutcome::NotReady
            }
        }
    }
}

/// Opens the instance UI full-screen on its virtual display.
#[async_trait]
pub trait KioskLauncher: Send + Sync {
    /// `pgid` is the instance's process group; the browser joins it so that
    /// stopping the instance also closes the window.
    async fn launch(&self, inst: &Instance, app_port: u16, pgid: i32) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct BrowserKiosk {
    cfg: AgentConfig,
}

impl BrowserKiosk {
    pub fn new(cfg: AgentConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl KioskLauncher for BrowserKiosk {
    async fn launch(&self, inst: &Instance, app_port: u16, pgid: i32) -> anyhow::Result<()> {
        let Some(display_no) = inst.display else {
            anyhow::bail!("instance has no display");
        };
        let profile = self.cfg.kiosk_profile_dir(&inst.slug());
        tokio::fs::create_dir_all(&profile).await?;

        let mut cmd = tokio::process::Command::new(&self.cfg.desktop.kiosk_browser);
        cmd.arg("--kiosk")
            .arg("--new-instance")
            .arg("--profile")
            .arg(&profile)
            .arg(format!("http://127.0.0.1:{app_port}/"))
            .env("DISPLAY", format!(":{display_no}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(pgid);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        tracing::info!(instance = %inst.id, ?pid, display = display_no, "kiosk browser started");
        let id = inst.id.clone();
        tokio::spawn(async move {
            if let Ok(status) = child.wait().await {
                tracing::debug!(instance = %id, %status, "kiosk browser exited");
            }
        });
        Ok(())
    }
}

/// Spawns one readiness watcher per started instance.
#[derive(Clone)]
pub struct StatusMonitor {
    store: Arc<dyn InstanceStore>,
    probe: Arc<dyn ReadinessProbe>,
    kiosk: Arc<dyn KioskLauncher>,
    timings: MonitorTimings,
}

impl StatusMonitor {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        probe: Arc<dyn ReadinessProbe>,
        kiosk: Arc<dyn KioskLauncher>,
        timings: MonitorTimings,
    ) -> Self {
        Self {
            store,
            probe,
            kiosk,
            timings,
        }
    }

    pub fn spawn(
        &self,
        id: InstanceId,
        app_port: u16,
        persistent: bool,
        process: ProcessHandle,
    ) -> WatcherHandle {
        let cancel = CancellationToken::new();
        let monitor = self.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { monitor.watch(id, app_port, persistent, process, cancel).await }
        });
        WatcherHandle::new(cancel, task)
    }

    async fn watch(
        self,
        id: InstanceId,
        app_port: u16,
        persistent: bool,
        process: ProcessHandle,
        cancel: CancellationToken,
    ) {
        let started = tokio::time::Instant::now();
        let mut stall_checked = false;
        tracing::debug!(instance = %id, port = app_port, "status watcher started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if process.has_exited() {
                tracing::info!(instance = %id, pid = process.pid, "process exited; watcher done");
                break;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                o = self.probe.probe(app_port) => o,
            };

            match outcome {
                ProbeOutcome::Ready => {
                    match compare_and_set_status(
                        self.store.as_ref(),
                        &id,
                        &[InstanceStatus::Starting, InstanceStatus::Stalled],
                        InstanceStatus::Started,
                    )
                    .await
                    {
                        Ok(true) => {
                            tracing::info!(instance = %id, port = app_port, "instance is ready");
                            if persistent {
                                self.open_kiosk(&id, app_port, process.pgid()).await;
                            }
                            break;
                        }
                        Ok(false) => {
                            tracing::debug!(instance = %id, "status moved elsewhere; not promoting");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(instance = %id, error = %e, "failed to record readiness");
                        }
                    }
                }
                ProbeOutcome::NotReady => {
                    if !stall_checked && started.elapsed() >= self.timings.stall_after {
                        match compare_and_set_status(
                            self.store.as_ref(),
                            &id,
                            &[InstanceStatus::Starting],
                            InstanceStatus::Stalled,
                        )
                        .await
                        {
                            Ok(changed) => {
                                stall_checked = true;
                                if changed {
                                    tracing::warn!(
                                        instance = %id,
                                        after_secs = started.elapsed().as_secs(),
                                        "instance not ready yet; marked stalled"
                                    );
                                }
                            }
                            Err(e) => {
                                tracing::warn!(instance = %id, error = %e, "failed to record stall");
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.timings.poll_interval) => {}
            }
        }
        tracing::debug!(instance = %id, "status watcher stopped");
    }

    async fn open_kiosk(&self, id: &InstanceId, app_port: u16, pgid: i32) {
        let inst = match self.store.get(id).await {
            Ok(inst) => inst,
            Err(e) => {
                tracing::warn!(instance = %id, error = %e, "kiosk skipped: record unavailable");
                return;
            }
        };
        if let Err(e) = self.kiosk.launch(&inst, app_port, pgid).await {
            tracing::warn!(instance = %id, error = %e, "failed to launch kiosk browser");
        }
    }
}
