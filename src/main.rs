//! `mt`: the parent process. Resolves configuration, stands up logging the
//! way `daemon::init_daemon_logging` does it, then serves the HTTP/WebSocket
//! surface until signaled to stop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mt::config::{Cli, MtConfig};
use mt::server::{self, ServerState};
use mt::session::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = MtConfig::from_cli(&cli)?;
    config.ensure_dirs()?;

    init_logging(&config)?;

    if cli.hash_password {
        bail!(mt::MtError::Unsupported(
            "--hash-password requires the external credential helper".into()
        ));
    }
    if cli.write_secret.is_some() {
        bail!(mt::MtError::Unsupported(
            "--write-secret requires the external credential helper".into()
        ));
    }
    if cli.generate_cert {
        bail!(mt::MtError::Unsupported(
            "--generate-cert requires the external certificate helper".into()
        ));
    }
    if cli.check_update || cli.update {
        bail!(mt::MtError::Unsupported(
            "update checking is handled by the external update helper".into()
        ));
    }

    let _lock = acquire_single_instance_lock(&config)?;

    let mthost_exe = mthost_path()?;
    let manager = Arc::new(SessionManager::new(config.clone(), mthost_exe));

    let adopted = manager.discover_existing_sessions().await;
    if !adopted.is_empty() {
        info!(count = adopted.len(), "adopted sessions left running by a prior instance");
    }

    let auth_token = std::env::var("MT_AUTH_TOKEN").unwrap_or_default();
    if auth_token.is_empty() {
        warn!("MT_AUTH_TOKEN is not set; the mux and state endpoints are unauthenticated");
    }
    let state = ServerState::new(manager.clone(), secrecy::SecretString::from(auth_token));

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "mt listening");

    let app = server::router(state).into_make_service_with_connect_info::<SocketAddr>();
    let shutdown_manager = manager.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, closing sessions");
            shutdown_manager.shutdown().await;
        })
        .await
        .context("server error")?;

    Ok(())
}

fn init_logging(config: &MtConfig) -> Result<()> {
    let log_path = config.logs_dir().join("mt.log");
    let file_appender = tracing_appender::rolling::never(
        config.logs_dir(),
        log_path.file_name().unwrap_or_default(),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leak the guard: it must live for the process lifetime to keep
    // flushing, and `main` never returns early enough to own it cleanly.
    Box::leak(Box::new(guard));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .with(fmt::layer().with_ansi(true))
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

struct InstanceLock {
    path: std::path::PathBuf,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Advisory single-instance guard: refuses to start if another `mt` process
/// already holds the lock file and is still alive.
fn acquire_single_instance_lock(config: &MtConfig) -> Result<InstanceLock> {
    let path = config.lock_path();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if process_alive(pid) {
                bail!("another mt instance (pid {pid}) is already running");
            }
        }
    }
    std::fs::write(&path, std::process::id().to_string())
        .context("failed to write instance lock")?;
    Ok(InstanceLock { path })
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    let mut system = sysinfo::System::new();
    system.refresh_processes();
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

fn mthost_path() -> Result<std::path::PathBuf> {
    let exe = std::env::current_exe().context("failed to resolve current executable path")?;
    let dir = exe.parent().context("executable has no parent directory")?;
    let name = if cfg!(windows) { "mthost.exe" } else { "mthost" };
    Ok(dir.join(name))
}
