//! Supervisor: owns the listening socket and the set of worker processes
//!
//! The supervisor binds the port once and hands the socket to every worker it
//! starts. Workers are kept in a stack: scaling up pushes new workers, scaling
//! down stops the most recently started ones first. Workers are told about
//! configuration changes over their stdin, and their stdout is funnelled into
//! the log relay.

use crate::config::{modified_time, GlobalConfig};
use crate::error::ConfigError;
use crate::relay::LogRelay;
use crate::worker::{Command, INHERITED_LISTEN_FD, LISTEN_FD_ENV, WORKER_SLOT_ENV};
use anyhow::Context;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often workers are reaped and the config file is checked
pub const CHECK_CONFIG_INTERVAL: Duration = Duration::from_secs(5);

/// Added to the longest service timeout to get the stop grace period
const STOP_GRACE_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Initializing,
    Steady,
    Reconfiguring,
    ShuttingDown,
}

/// How to move from `current` workers to `desired` workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MembershipPlan {
    pub spawn: usize,
    pub stop: usize,
}

pub fn plan_membership(current: usize, desired: usize) -> MembershipPlan {
    MembershipPlan {
        spawn: desired.saturating_sub(current),
        stop: current.saturating_sub(desired),
    }
}

/// Outcome of one reconfiguration pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconfigureSummary {
    pub spawned: usize,
    pub failed: usize,
    pub stopped: usize,
    pub reconfigured: usize,
    pub active: usize,
}

/// A running worker process
pub struct WorkerHandle {
    slot: usize,
    pid: u32,
    child: Child,
    commands: ChildStdin,
}

impl WorkerHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    async fn send(&mut self, command: Command) -> std::io::Result<()> {
        self.commands
            .write_all(format!("{}\n", command).as_bytes())
            .await?;
        self.commands.flush().await
    }
}

pub struct Supervisor {
    config_path: PathBuf,
    port: u16,
    listener: std::net::TcpListener,
    workers: Vec<WorkerHandle>,
    retiring: Vec<JoinHandle<()>>,
    desired: usize,
    next_slot: usize,
    reconfigured_at: Option<SystemTime>,
    worker_program: PathBuf,
    relay: LogRelay,
    stop_grace: Duration,
    state: SupervisorState,
}

impl Supervisor {
    /// Read the config and bind its port. No workers are started yet.
    pub fn bind(config_path: impl Into<PathBuf>, relay: LogRelay) -> anyhow::Result<Self> {
        let config_path = config_path.into();
        let config = GlobalConfig::load(&config_path)?;

        let listener = std::net::TcpListener::bind(("0.0.0.0", config.port))
            .with_context(|| format!("failed to bind port {}", config.port))?;
        info!(addr = %listener.local_addr()?, "Listening socket bound");

        Ok(Self {
            config_path,
            port: config.port,
            listener,
            workers: Vec::new(),
            retiring: Vec::new(),
            desired: 0,
            next_slot: 0,
            reconfigured_at: None,
            worker_program: std::env::current_exe().context("cannot locate own executable")?,
            relay,
            stop_grace: STOP_GRACE_MARGIN,
            state: SupervisorState::Initializing,
        })
    }

    /// Start workers from a different executable (it must accept the worker protocol)
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Process ids of the active workers, oldest first
    pub fn worker_ids(&self) -> Vec<u32> {
        self.workers.iter().map(|w| w.pid).collect()
    }

    /// Re-read the config file and adjust the worker set.
    ///
    /// On error nothing changes: the running workers keep their configuration.
    pub async fn reconfigure(&mut self) -> anyhow::Result<ReconfigureSummary> {
        self.state = SupervisorState::Reconfiguring;
        let result = self.apply_config().await;
        self.state = SupervisorState::Steady;
        result
    }

    async fn apply_config(&mut self) -> anyhow::Result<ReconfigureSummary> {
        // Recorded before reading so a broken file is not retried every check.
        self.reconfigured_at = modified_time(&self.config_path);
        let config = GlobalConfig::load(&self.config_path)?;
        if config.port != self.port {
            return Err(ConfigError::PortChanged {
                current: self.port,
                requested: config.port,
            }
            .into());
        }

        self.desired = config.processes;
        self.stop_grace = config
            .services
            .iter()
            .map(|s| s.request_timeout())
            .max()
            .unwrap_or_default()
            + STOP_GRACE_MARGIN;

        let plan = plan_membership(self.workers.len(), config.processes);
        let mut summary = ReconfigureSummary::default();

        if plan.stop > 0 {
            for _ in 0..plan.stop {
                if let Some(worker) = self.workers.pop() {
                    self.retire(worker).await;
                    summary.stopped += 1;
                }
            }
            summary.reconfigured = self.broadcast(Command::Reconfigure).await;
        } else {
            summary.reconfigured = self.broadcast(Command::Reconfigure).await;
            for _ in 0..plan.spawn {
                match self.spawn_worker() {
                    Ok(worker) => {
                        self.workers.push(worker);
                        summary.spawned += 1;
                    }
                    Err(e) => {
                        error!(error = %format!("{:#}", e), "Failed to start worker");
                        summary.failed += 1;
                    }
                }
            }
        }

        summary.active = self.workers.len();
        info!(
            workers = summary.active,
            spawned = summary.spawned,
            stopped = summary.stopped,
            reconfigured = summary.reconfigured,
            "Configuration applied"
        );
        Ok(summary)
    }

    /// Send a command to every active worker, returning how many received it
    async fn broadcast(&mut self, command: Command) -> usize {
        let mut delivered = 0;
        for worker in &mut self.workers {
            match worker.send(command).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(slot = worker.slot, pid = worker.pid, %command, error = %e, "Failed to signal worker")
                }
            }
        }
        delivered
    }

    fn spawn_worker(&mut self) -> anyhow::Result<WorkerHandle> {
        let slot = self.next_slot;

        let mut cmd = tokio::process::Command::new(&self.worker_program);
        cmd.arg(&self.config_path)
            .env(LISTEN_FD_ENV, INHERITED_LISTEN_FD.to_string())
            .env(WORKER_SLOT_ENV, slot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = self.listener.as_raw_fd();
            unsafe {
                cmd.pre_exec(move || share_listener(fd));
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to run {}", self.worker_program.display()))?;
        self.next_slot += 1;

        let pid = child.id().unwrap_or_default();
        let commands = child
            .stdin
            .take()
            .context("worker stdin was not captured")?;
        if let Some(stdout) = child.stdout.take() {
            self.relay.attach(format!("worker({})", pid), stdout);
        }

        info!(slot, pid, "Started worker");
        Ok(WorkerHandle {
            slot,
            pid,
            child,
            commands,
        })
    }

    /// Ask a worker to stop; kill it if it outlives the grace period
    async fn retire(&mut self, mut worker: WorkerHandle) {
        info!(slot = worker.slot, pid = worker.pid, "Stopping worker");
        if let Err(e) = worker.send(Command::Stop).await {
            debug!(pid = worker.pid, error = %e, "Worker did not take stop command");
        }

        let grace_period = self.stop_grace;
        self.retiring.push(tokio::spawn(async move {
            let WorkerHandle {
                pid,
                mut child,
                commands,
                ..
            } = worker;
            drop(commands);

            match tokio::time::timeout(grace_period, child.wait()).await {
                Ok(Ok(status)) => info!(pid, ?status, "Worker exited"),
                Ok(Err(e)) => warn!(pid, error = %e, "Error waiting for worker to exit"),
                Err(_) => {
                    warn!(
                        pid,
                        grace_period_secs = grace_period.as_secs(),
                        "Grace period exceeded, killing worker"
                    );
                    let _ = child.kill().await;
                }
            }
        }));
    }

    /// Drop workers that exited on their own. Returns how many were lost.
    fn reap_exited(&mut self) -> usize {
        let before = self.workers.len();
        self.workers.retain_mut(|worker| match worker.child.try_wait() {
            Ok(Some(status)) => {
                warn!(slot = worker.slot, pid = worker.pid, ?status, "Worker exited unexpectedly");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = worker.pid, error = %e, "Failed to poll worker");
                true
            }
        });
        self.retiring.retain(|task| !task.is_finished());
        before - self.workers.len()
    }

    /// Start workers until the configured count is reached again
    fn replenish(&mut self) {
        while self.workers.len() < self.desired {
            match self.spawn_worker() {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Failed to restart worker");
                    break;
                }
            }
        }
    }

    /// Periodic check: reap, reconfigure on a newer config file, restore the worker count.
    pub async fn check(&mut self) {
        let lost = self.reap_exited();

        let modified = modified_time(&self.config_path);
        if modified.is_some() && modified > self.reconfigured_at {
            info!(path = %self.config_path.display(), "Config file changed");
            if let Err(e) = self.reconfigure().await {
                error!(error = %format!("{:#}", e), "Reconfigure failed; keeping current configuration");
            }
        }

        if lost > 0 || self.workers.len() < self.desired {
            self.replenish();
        }
    }

    /// Run until `shutdown_rx` flips to true. Each message on `reload_rx`
    /// forces a reconfiguration.
    pub async fn run(
        mut self,
        mut reload_rx: mpsc::Receiver<()>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if self.state == SupervisorState::Initializing {
            self.reconfigure().await?;
        }

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + CHECK_CONFIG_INTERVAL,
            CHECK_CONFIG_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check().await,
                Some(()) = reload_rx.recv() => {
                    info!("Reload requested");
                    if let Err(e) = self.reconfigure().await {
                        error!(error = %format!("{:#}", e), "Reconfigure failed; keeping current configuration");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every worker, newest first, and wait for them to exit
    pub async fn shutdown(mut self) {
        self.state = SupervisorState::ShuttingDown;
        info!(workers = self.workers.len(), "Stopping all workers");
        while let Some(worker) = self.workers.pop() {
            self.retire(worker).await;
        }
        for task in self.retiring.drain(..) {
            let _ = task.await;
        }
        info!("All workers stopped");
    }
}

/// Runs in the forked child: place the listening socket on the agreed descriptor
#[cfg(unix)]
fn share_listener(fd: std::os::unix::io::RawFd) -> std::io::Result<()> {
    if fd == INHERITED_LISTEN_FD {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    } else if unsafe { libc::dup2(fd, INHERITED_LISTEN_FD) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_membership() {
        assert_eq!(plan_membership(0, 3), MembershipPlan { spawn: 3, stop: 0 });
        assert_eq!(plan_membership(2, 4), MembershipPlan { spawn: 2, stop: 0 });
        assert_eq!(plan_membership(4, 2), MembershipPlan { spawn: 0, stop: 2 });
        assert_eq!(plan_membership(3, 3), MembershipPlan::default());
    }

    async fn relay() -> LogRelay {
        let (relay, _handle) = LogRelay::start(crate::relay::LogSink::Discard)
            .await
            .unwrap();
        relay
    }

    fn write_config(path: &Path, port: u16, processes: usize) {
        std::fs::write(path, format!("port = {}\nprocesses = {}\n", port, processes)).unwrap();
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multiserver.toml");
        write_config(&path, 0, 1);

        let supervisor = Supervisor::bind(&path, relay().await).unwrap();
        assert_ne!(supervisor.local_addr().unwrap().port(), 0);
        assert_eq!(supervisor.state(), SupervisorState::Initializing);
        assert!(supervisor.worker_ids().is_empty());
    }

    #[tokio::test]
    async fn test_bind_requires_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multiserver.toml");
        std::fs::write(&path, "processes = 1\n").unwrap();
        assert!(Supervisor::bind(&path, relay().await).is_err());
    }

    #[tokio::test]
    async fn test_port_change_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multiserver.toml");
        write_config(&path, 0, 1);
        let mut supervisor = Supervisor::bind(&path, relay().await).unwrap();

        write_config(&path, 1, 1);
        let err = supervisor.reconfigure().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::PortChanged { current: 0, requested: 1 })
        ));
        assert!(supervisor.worker_ids().is_empty());
    }

    #[tokio::test]
    async fn test_failed_spawn_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multiserver.toml");
        write_config(&path, 0, 2);

        let mut supervisor = Supervisor::bind(&path, relay().await)
            .unwrap()
            .with_worker_program(dir.path().join("no-such-binary"));
        let summary = supervisor.reconfigure().await.unwrap();
        assert_eq!(summary.spawned, 0);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.active, 0);
        assert_eq!(supervisor.state(), SupervisorState::Steady);
    }
}
