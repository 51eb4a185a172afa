//! Remex command line client
//!
//! Runs one command on a remote host, streaming its output to stdout and
//! exiting with the remote exit code.

use anyhow::{bail, Context, Result};
use clap::Parser;
use remex::{correlation, CorrelationId, ExitStatus, Session, SessionConfig};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

/// Exit code used when the remote command reported no status or never ran
const INDETERMINATE_EXIT: u8 = 255;

#[derive(Parser, Debug)]
#[command(name = "remex", version, about = "Run a command on a remote host over SSH")]
struct Cli {
    /// JSON session configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Private key used for authentication
    #[arg(short = 'i', long, value_name = "KEY")]
    identity: Option<PathBuf>,

    /// Environment variable holding the SSH password
    #[arg(long, value_name = "VAR")]
    password_env: Option<String>,

    /// Output drain interval in seconds (0 streams every chunk)
    #[arg(long, value_name = "SECS")]
    buffer: Option<f64>,

    /// Give up on the command after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Session name used in logs
    #[arg(long)]
    name: Option<String>,

    /// Correlation identifier attached to output and log lines
    #[arg(long, env = "REMEX_CORRELATION_ID")]
    correlation_id: Option<String>,

    /// Append a local file to a remote path before running the command
    #[arg(long = "upload", value_name = "LOCAL:REMOTE", value_parser = parse_upload)]
    uploads: Vec<Upload>,

    /// Remote host as [user@]host[:port]
    target: Option<String>,

    /// Command to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Upload {
    local: PathBuf,
    remote: String,
}

fn parse_upload(arg: &str) -> std::result::Result<Upload, String> {
    match arg.split_once(':') {
        Some((local, remote)) if !local.is_empty() && !remote.is_empty() => Ok(Upload {
            local: PathBuf::from(local),
            remote: remote.to_string(),
        }),
        _ => Err(format!("expected LOCAL:REMOTE, got `{}`", arg)),
    }
}

impl Cli {
    /// Merge the configuration file, target and flags into one configuration
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_json_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => SessionConfig::default(),
        };

        match &self.target {
            Some(target) => {
                let parsed = Session::ssh(target).build_config();
                config.ssh.host = parsed.ssh.host;
                config.ssh.port = parsed.ssh.port;
                config.ssh.username = parsed.ssh.username;
            }
            None if self.config.is_none() => bail!("No target given and no configuration file to read one from"),
            None => {}
        }

        if let Some(key) = &self.identity {
            config.ssh.key_path = Some(key.clone());
        }
        if let Some(var) = &self.password_env {
            let password = std::env::var(var)
                .with_context(|| format!("Password variable {} is not set", var))?;
            config.ssh.password = Some(password);
        }
        if let Some(buffer) = self.buffer {
            config.buffer = buffer;
        }
        if let Some(timeout) = self.timeout {
            config.command_timeout = Some(timeout);
        }

        config.validate()?;
        Ok(config)
    }

    fn session_name(&self, config: &SessionConfig) -> String {
        self.name.clone().unwrap_or_else(|| format!("{}@{}", config.ssh.username, config.ssh.host))
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let config = cli.session_config()?;
    let mut session = Session::new(cli.session_name(&config), config);

    session.on_output(|chunk| {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(&chunk.data).and_then(|_| stdout.flush()) {
            warn!("Failed to write output: {}", e);
        }
    });

    let result = execute(&cli, &mut session).await;
    if let Err(e) = session.close().await {
        warn!("Failed to close session: {}", e);
    }
    result
}

async fn execute(cli: &Cli, session: &mut Session) -> Result<ExitStatus> {
    for upload in &cli.uploads {
        let content = tokio::fs::read(&upload.local)
            .await
            .with_context(|| format!("Failed to read {}", upload.local.display()))?;
        info!("Uploading {} to {}", upload.local.display(), upload.remote);

        let status = session.upload_file(&upload.remote, &content).await?;
        if !status.success() {
            bail!("Upload of {} to {} failed with {}", upload.local.display(), upload.remote, status);
        }
    }

    let command = cli.command.join(" ");
    let status = match session.config().command_timeout() {
        Some(limit) => session.exec_timeout(&command, limit).await?,
        None => session.exec(&command).await?,
    };
    Ok(status)
}

fn exit_code(status: ExitStatus) -> u8 {
    status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(INDETERMINATE_EXIT)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("remex=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let id = cli.correlation_id.as_deref().map(CorrelationId::from).unwrap_or_else(CorrelationId::generate);
    let span = info_span!("remex", correlation_id = %id);

    let outcome = correlation::scope(id, run(cli)).instrument(span).await;
    match outcome {
        Ok(status) => {
            if status.is_indeterminate() {
                warn!("Remote command finished with {}", status);
            }
            ExitCode::from(exit_code(status))
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(INDETERMINATE_EXIT)
        }
    }
}
