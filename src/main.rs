use multiserver::config::GlobalConfig;
use multiserver::relay::{init_tracing, LogRelay, LogSink};
use multiserver::supervisor::Supervisor;
use multiserver::worker::LISTEN_FD_ENV;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() -> ! {
    println!("Usage: {} <config.toml>", PKG_NAME);
    println!();
    println!("Starts a supervisor that serves the services described in the config file.");
    println!("Send SIGHUP to reload the configuration, SIGTERM or SIGINT to stop.");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = match std::env::args().nth(1).as_deref() {
        None | Some("-h") | Some("--help") | Some("help") | Some("-?") => usage(),
        Some(path) => PathBuf::from(path),
    };

    if std::env::var_os(LISTEN_FD_ENV).is_some() {
        // A worker starts even on a broken file and serves no routes until
        // the file is fixed; the supervisor would otherwise respawn it forever.
        let config = GlobalConfig::load(&config_path).ok();
        return run_worker(&config_path, config.as_ref()).await;
    }

    let config = GlobalConfig::load(&config_path)?;
    run_supervisor(&config_path, &config).await
}

#[cfg(unix)]
async fn run_worker(config_path: &Path, config: Option<&GlobalConfig>) -> anyhow::Result<()> {
    let logger = config.map(|c| c.logger.clone()).unwrap_or_default();
    // Worker output goes to stdout; the supervisor relays it.
    init_tracing(
        format!("worker({})", std::process::id()),
        logger.debug,
        std::io::stdout,
    );
    match config {
        Some(config) => set_process_title(&format!("{}/{}/worker", PKG_NAME, config.port)),
        None => set_process_title(&format!("{}/worker", PKG_NAME)),
    }

    multiserver::worker::run_worker(config_path).await
}

#[cfg(not(unix))]
async fn run_worker(_config_path: &Path, _config: Option<&GlobalConfig>) -> anyhow::Result<()> {
    anyhow::bail!("worker processes require a Unix platform")
}

async fn run_supervisor(config_path: &Path, config: &GlobalConfig) -> anyhow::Result<()> {
    let (relay, _relay_task) = LogRelay::start(LogSink::from_config(&config.logger)).await?;
    init_tracing("supervisor".to_string(), config.logger.debug, relay.clone());
    info!(name = PKG_NAME, version = VERSION, path = %config_path.display(), "Starting supervisor");

    // Write PID file if configured (with exclusive lock on Unix)
    let _pid_file = match &config.pid_file {
        Some(path) => {
            let pid_file = PidFile::create(path)?;
            info!(path = %path.display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let supervisor = Supervisor::bind(config_path, relay.clone())?;
    set_process_title(&format!("{}/{}/master", PKG_NAME, config.port));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, reload_rx) = mpsc::channel(4);
    let mut supervisor_handle = tokio::spawn(supervisor.run(reload_rx, shutdown_rx));

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration");
                    if reload_tx.try_send(()).is_err() {
                        warn!("Reload already pending");
                    }
                }
                result = &mut supervisor_handle => {
                    return finish(result, &relay, config.pid_file.as_deref()).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
            result = &mut supervisor_handle => {
                return finish(result, &relay, config.pid_file.as_deref()).await;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let result = supervisor_handle.await;
    finish(result, &relay, config.pid_file.as_deref()).await
}

async fn finish(
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
    relay: &LogRelay,
    pid_file: Option<&Path>,
) -> anyhow::Result<()> {
    let outcome = match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %format!("{:#}", e), "Supervisor failed");
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "Supervisor task panicked");
            Err(e.into())
        }
    };

    if let Some(path) = pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    let _ = tokio::time::timeout(Duration::from_secs(2), relay.flush()).await;
    outcome
}

/// Best-effort process name, visible in `ps -o comm` and `top`
#[cfg(target_os = "linux")]
fn set_process_title(title: &str) {
    if let Ok(name) = std::ffi::CString::new(title) {
        // The kernel keeps the first 15 bytes.
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_process_title(_title: &str) {}

#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        // Not truncated until the lock is held, so a second supervisor
        // cannot wipe the running one's PID.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another supervisor is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}
