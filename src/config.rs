//! CLI surface and on-disk layout for the `mt` parent process.
//!
//! Flag parsing mirrors this codebase's `clap` derive style; state-dir
//! resolution mirrors the `daemon::get_daemon_dir` family of helpers, but
//! scoped to an OS-appropriate per-user or per-service directory instead of
//! a single fixed `~/.cco`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

pub const DEFAULT_PORT: u16 = 2000;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_RING_CAPACITY: usize = 1024 * 1024;
pub const MIN_DIM: u16 = 1;
pub const MAX_DIM: u16 = 500;

#[derive(Parser, Debug, Clone)]
#[command(name = "mt")]
#[command(about = "Self-hosted web terminal multiplexer")]
#[command(version)]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind to.
    #[arg(long, default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Hash a password read from stdin and print the hash. External
    /// collaborator in this build (see SPEC_FULL.md §6).
    #[arg(long)]
    pub hash_password: bool,

    /// Write a generated secret of the given kind to the state directory.
    #[arg(long, value_name = "KIND")]
    pub write_secret: Option<SecretKind>,

    /// Run in OS-service mode (affects state-dir resolution only).
    #[arg(long)]
    pub service_mode: bool,

    /// Generate a self-signed TLS certificate. External collaborator.
    #[arg(long)]
    pub generate_cert: bool,

    /// Overwrite an existing certificate when `--generate-cert` is set.
    #[arg(long)]
    pub force: bool,

    /// Check for an available update without installing it.
    #[arg(long)]
    pub check_update: bool,

    /// Download and install an available update.
    #[arg(long)]
    pub update: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum SecretKind {
    PasswordHash,
    SessionSecret,
    CertificatePassword,
}

/// Resolved runtime configuration, derived from `Cli` plus environment.
#[derive(Debug, Clone)]
pub struct MtConfig {
    pub port: u16,
    pub bind: String,
    pub state_dir: PathBuf,
    pub ring_capacity: usize,
    pub service_mode: bool,
}

impl MtConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        Ok(Self {
            port: cli.port,
            bind: cli.bind.clone(),
            state_dir: state_dir(cli.service_mode)?,
            ring_capacity: DEFAULT_RING_CAPACITY,
            service_mode: cli.service_mode,
        })
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("mt.lock")
    }

    /// Create `state_dir`, `sessions/`, and `logs/` if they don't exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.sessions_dir())
            .context("failed to create sessions directory")?;
        std::fs::create_dir_all(self.logs_dir()).context("failed to create logs directory")?;
        Ok(())
    }
}

/// OS-appropriate state directory:
/// - Windows service mode: `%ProgramData%\MidTerm`
/// - Unix service mode: `/usr/local/etc/midterm`
/// - otherwise: `~/.midterm`
fn state_dir(service_mode: bool) -> Result<PathBuf> {
    if service_mode {
        #[cfg(windows)]
        {
            let program_data = std::env::var_os("ProgramData")
                .map(PathBuf::from)
                .context("ProgramData environment variable not set")?;
            return Ok(program_data.join("MidTerm"));
        }
        #[cfg(not(windows))]
        {
            return Ok(PathBuf::from("/usr/local/etc/midterm"));
        }
    }

    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".midterm"))
}

/// Clamp a client-requested dimension into the valid `[MIN_DIM, MAX_DIM]`
/// range, per the Session invariant `cols, rows ∈ [1, 500]`.
pub fn clamp_dim(value: u16) -> u16 {
    value.clamp(MIN_DIM, MAX_DIM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_dim_respects_bounds() {
        assert_eq!(clamp_dim(0), MIN_DIM);
        assert_eq!(clamp_dim(1), 1);
        assert_eq!(clamp_dim(500), 500);
        assert_eq!(clamp_dim(9000), MAX_DIM);
    }

    #[test]
    fn user_state_dir_is_under_home() {
        let dir = state_dir(false).unwrap();
        assert!(dir.ends_with(".midterm"));
    }
}
