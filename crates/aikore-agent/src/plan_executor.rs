//! Runs a [`LaunchPlan`] as the anchor of an instance's process group.
//!
//! `aikore-agent supervise <plan>` is spawned by the launcher as the group
//! leader. It starts each step in order, then waits on every child. On
//! SIGTERM, SIGINT or SIGHUP it terminates everything it started.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::signal::unix::{Signal, SignalKind, signal};

use crate::launch_plan::{LaunchPlan, LaunchStep};
use crate::process_support::{
    descendant_pids, format_error_chain, signal_pid, sweep_own_group, terminate_pids,
};

/// Side effects of plan steps.
#[async_trait]
pub trait StepRunner: Send {
    /// Starts a long-running process and returns its pid.
    async fn spawn(&mut self, name: &str, program: &str, args: &[String]) -> anyhow::Result<u32>;

    /// Runs a command to completion. Returns whether it exited successfully.
    async fn run(&mut self, program: &str, args: &[String]) -> anyhow::Result<bool>;

    /// Whether the process started under `name` is still running.
    fn is_running(&mut self, name: &str) -> bool;

    async fn port_open(&mut self, port: u16) -> bool;

    async fn sleep(&mut self, d: Duration);
}

pub struct PlanExecutor {
    plan: LaunchPlan,
}

impl PlanExecutor {
    pub fn new(plan: LaunchPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    /// Executes every step in order. The first failing step aborts the plan.
    pub async fn execute(&self, runner: &mut dyn StepRunner) -> anyhow::Result<()> {
        for step in &self.plan.steps {
            match step {
                LaunchStep::Spawn {
                    name,
                    program,
                    args,
                } => {
                    let pid = runner
                        .spawn(name, program, args)
                        .await
                        .with_context(|| format!("start {name} ({program})"))?;
                    tracing::info!(step = %name, pid, "step started");
                }
                LaunchStep::WaitForPort {
                    port,
                    attempts,
                    interval_ms,
                    guard,
                } => {
                    wait_for_port(runner, *port, *attempts, *interval_ms, guard.as_deref()).await?;
                    tracing::info!(port, "port is accepting connections");
                }
                LaunchStep::Run {
                    name,
                    program,
                    args,
                    best_effort,
                } => {
                    let ok = match runner.run(program, args).await {
                        Ok(ok) => ok,
                        Err(e) if *best_effort => {
                            tracing::warn!(step = %name, error = %format_error_chain(&e), "optional step failed");
                            continue;
                        }
                        Err(e) => return Err(e.context(format!("run {name}"))),
                    };
                    if !ok {
                        if *best_effort {
                            tracing::warn!(step = %name, "optional step exited unsuccessfully");
                        } else {
                            anyhow::bail!("{name} exited unsuccessfully");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

async fn wait_for_port(
    runner: &mut dyn StepRunner,
    port: u16,
    attempts: u32,
    interval_ms: u64,
    guard: Option<&str>,
) -> anyhow::Result<()> {
    for _ in 0..attempts.max(1) {
        if runner.port_open(port).await {
            return Ok(());
        }
        if let Some(name) = guard
            && !runner.is_running(name)
        {
            anyhow::bail!("{name} exited before port {port} opened");
        }
        runner.sleep(Duration::from_millis(interval_ms)).await;
    }
    anyhow::bail!("port {port} not ready after {attempts} attempts")
}

/// Real processes in the current process group.
pub struct ProcessRunner {
    workdir: PathBuf,
    children: Vec<(String, tokio::process::Child)>,
}

impl ProcessRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            children: Vec::new(),
        }
    }

    /// Waits for every spawned child to exit.
    pub async fn wait_all(&mut self) {
        for (name, child) in &mut self.children {
            match child.wait().await {
                Ok(status) => tracing::info!(step = %name, %status, "process exited"),
                Err(e) => tracing::warn!(step = %name, error = %e, "wait failed"),
            }
        }
    }

    /// Terminates every child still running plus their descendants.
    pub async fn shutdown(&mut self, grace: Duration) {
        let mut grandchildren = Vec::new();
        for (name, child) in &mut self.children {
            let (Ok(None), Some(pid)) = (child.try_wait(), child.id()) else {
                continue;
            };
            grandchildren.extend(descendant_pids(pid));
            tracing::info!(step = %name, pid, "terminating");
            let _ = signal_pid(pid, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let running = self
                .children
                .iter_mut()
                .any(|(_, c)| matches!(c.try_wait(), Ok(None)));
            if !running || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for (name, child) in &mut self.children {
            if matches!(child.try_wait(), Ok(None)) {
                tracing::warn!(step = %name, "escalating to SIGKILL");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        if !grandchildren.is_empty() {
            terminate_pids(&grandchildren, Duration::from_millis(500)).await;
        }
    }
}

#[async_trait]
impl StepRunner for ProcessRunner {
    async fn spawn(&mut self, name: &str, program: &str, args: &[String]) -> anyhow::Result<u32> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn {program}"))?;
        let pid = child.id().unwrap_or_default();
        self.children.push((name.to_string(), child));
        Ok(pid)
    }

    async fn run(&mut self, program: &str, args: &[String]) -> anyhow::Result<bool> {
        let status = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .status()
            .await
            .with_context(|| format!("run {program}"))?;
        Ok(status.success())
    }

    fn is_running(&mut self, name: &str) -> bool {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .is_some_and(|(_, c)| matches!(c.try_wait(), Ok(None)))
    }

    async fn port_open(&mut self, port: u16) -> bool {
        tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok()
    }

    async fn sleep(&mut self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// SIGTERM, SIGINT and SIGHUP, installed together.
pub struct ShutdownSignals {
    term: Signal,
    int: Signal,
    hup: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.hup.recv() => "SIGHUP",
        }
    }
}

/// Entry point of `aikore-agent supervise <plan>`.
pub async fn supervise(plan_path: &Path, grace: Duration) -> anyhow::Result<()> {
    let mut signals = ShutdownSignals::install().context("install signal handlers")?;
    let plan = LaunchPlan::load(plan_path)
        .await
        .with_context(|| format!("load launch plan {}", plan_path.display()))?;
    tracing::info!(plan = %plan_path.display(), steps = plan.steps.len(), "supervising launch plan");

    let mut runner = ProcessRunner::new(&plan.workdir);
    let executor = PlanExecutor::new(plan);

    let outcome = tokio::select! {
        r = async {
            executor.execute(&mut runner).await?;
            runner.wait_all().await;
            anyhow::Ok(())
        } => r,
        sig = signals.recv() => {
            tracing::info!(signal = sig, "shutdown requested");
            Ok(())
        }
    };

    if let Err(e) = &outcome {
        tracing::error!(error = %format_error_chain(e), "launch plan failed");
    }
    runner.shutdown(grace).await;
    sweep_own_group(grace).await;
    outcome
}
