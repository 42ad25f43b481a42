//! `mthost`: one child process per terminal session. Parses the arguments
//! `SessionManager::create` hands it, then runs `mt::host::run` until the
//! shell exits or the parent asks it to close.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mt::host::{self, TtyHostOptions};

#[derive(Parser, Debug)]
#[command(name = "mthost")]
struct Args {
    #[arg(long)]
    session_id: String,

    #[arg(long)]
    shell: String,

    #[arg(long)]
    cols: u16,

    #[arg(long)]
    rows: u16,

    #[arg(long)]
    socket: PathBuf,

    #[arg(long)]
    cwd: Option<String>,

    /// Repeatable; forwarded verbatim as shell arguments.
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Unix-only helper mode: exec the given command under the already-open
    /// pty slave instead of a login shell. Accepted for interface parity
    /// with the external pty-exec contract; this build always spawns the
    /// shell directly, so the flag is rejected rather than silently ignored.
    #[arg(long)]
    pty_exec: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.pty_exec.is_some() {
        anyhow::bail!(mt::MtError::Unsupported(
            "--pty-exec is not implemented in this build".into()
        ));
    }

    let ring_capacity = mt::config::DEFAULT_RING_CAPACITY;

    host::run(TtyHostOptions {
        session_id: args.session_id,
        shell_path: args.shell,
        args: args.args,
        cwd: args.cwd,
        cols: args.cols,
        rows: args.rows,
        env: Vec::new(),
        socket_path: args.socket,
        ring_capacity,
    })
    .await
    .context("mthost event loop exited with an error")?;

    Ok(())
}
