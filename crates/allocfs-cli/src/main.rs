#![deny(unsafe_code)]

//! allocfs CLI: runs the agent and browses allocation filesystems through it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use allocfs_config::AppConfig;
use allocfs_core::{Agent, AgentClient, FileInfo, LogType, LogsRequest, Origin};

/// allocfs: inspect allocation files and tail task logs over HTTP.
#[derive(Parser)]
#[command(name = "allocfs", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "allocfs.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent.
    Agent,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// List a directory in an allocation.
    Ls {
        #[command(flatten)]
        target: Target,
        alloc_id: String,
        #[arg(default_value = "/")]
        path: String,
        /// Print raw JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show metadata for a path in an allocation.
    Stat {
        #[command(flatten)]
        target: Target,
        alloc_id: String,
        path: String,
        /// Print raw JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a file from an allocation.
    Cat {
        #[command(flatten)]
        target: Target,
        alloc_id: String,
        path: String,
    },

    /// Print part of a file from an allocation.
    Readat {
        #[command(flatten)]
        target: Target,
        alloc_id: String,
        path: String,
        /// Byte offset to start at.
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Maximum number of bytes to read.
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Stream a task's stdout or stderr.
    Logs {
        #[command(flatten)]
        target: Target,
        alloc_id: String,
        task: String,
        #[arg(long = "type", value_enum, default_value_t = StreamArg::Stdout)]
        log_type: StreamArg,
        /// Keep streaming as the task writes.
        #[arg(short, long)]
        follow: bool,
        #[arg(long, value_enum, default_value_t = OriginArg::Start)]
        origin: OriginArg,
        /// Byte offset relative to the origin.
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Print framed JSON lines instead of the raw log.
        #[arg(long)]
        framed: bool,
    },
}

/// Where client commands send their requests.
#[derive(clap::Args)]
struct Target {
    /// Agent address (`host:port`); defaults to the configured listen address.
    #[arg(short, long)]
    address: Option<String>,

    /// Auth token forwarded to the agent.
    #[arg(long)]
    token: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StreamArg {
    Stdout,
    Stderr,
}

impl From<StreamArg> for LogType {
    fn from(arg: StreamArg) -> Self {
        match arg {
            StreamArg::Stdout => LogType::Stdout,
            StreamArg::Stderr => LogType::Stderr,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OriginArg {
    Start,
    End,
}

impl From<OriginArg> for Origin {
    fn from(arg: OriginArg) -> Self {
        match arg {
            OriginArg::Start => Origin::Start,
            OriginArg::End => Origin::End,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(filter_directive(cli.verbose, &config))),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Agent => cmd_agent(config).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
        Commands::Ls {
            target,
            alloc_id,
            path,
            json,
        } => {
            let entries = client(&target, &config).list(&alloc_id, &path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!("{}", format_entry(entry));
                }
            }
        }
        Commands::Stat {
            target,
            alloc_id,
            path,
            json,
        } => {
            let info = client(&target, &config).stat(&alloc_id, &path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{}", format_entry(&info));
            }
        }
        Commands::Cat {
            target,
            alloc_id,
            path,
        } => {
            let mut out = tokio::io::stdout();
            client(&target, &config)
                .cat(&alloc_id, &path, &mut out)
                .await?;
            out.flush().await?;
        }
        Commands::Readat {
            target,
            alloc_id,
            path,
            offset,
            limit,
        } => {
            let mut out = tokio::io::stdout();
            client(&target, &config)
                .read_at(&alloc_id, &path, offset, limit, &mut out)
                .await?;
            out.flush().await?;
        }
        Commands::Logs {
            target,
            alloc_id,
            task,
            log_type,
            follow,
            origin,
            offset,
            framed,
        } => {
            let mut request = LogsRequest::new(alloc_id, task, log_type.into());
            request.follow = follow;
            request.origin = origin.into();
            request.offset = offset;
            request.plain_text = !framed;
            cmd_logs(client(&target, &config), request).await?;
        }
    }

    Ok(())
}

/// Log filter when `RUST_LOG` is unset: `-v` flags win over the config file.
fn filter_directive(verbose: u8, config: &AppConfig) -> String {
    match verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

async fn cmd_agent(config: AppConfig) -> Result<()> {
    info!(
        addr = %config.http.socket_addr(),
        alloc_root = %config.alloc.root,
        "Starting allocfs agent"
    );
    let agent = Agent::new(config);
    agent.run().await?;
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("failed to render config")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn cmd_logs(client: AgentClient, request: LogsRequest) -> Result<()> {
    let mut out = tokio::io::stdout();
    tokio::select! {
        result = client.logs(&request, &mut out) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing log stream");
        }
    }
    out.flush().await?;
    Ok(())
}

fn client(target: &Target, config: &AppConfig) -> AgentClient {
    let addr = target
        .address
        .clone()
        .unwrap_or_else(|| config.http.socket_addr());
    let client = AgentClient::new(addr);
    match &target.token {
        Some(token) => client.with_token(token),
        None => client,
    }
}

fn format_entry(entry: &FileInfo) -> String {
    let name = if entry.is_dir {
        format!("{}/", entry.name)
    } else {
        entry.name.clone()
    };
    format!(
        "{} {:>10} {} {}",
        entry.file_mode,
        entry.size,
        entry.mod_time.format("%Y-%m-%dT%H:%M:%SZ"),
        name
    )
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        AppConfig::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_verbosity_overrides_config_level() {
        let mut config = AppConfig::default();
        config.logging.level = "warn".to_string();

        assert_eq!(filter_directive(0, &config), "warn");
        assert_eq!(filter_directive(1, &config), "debug");
        assert_eq!(filter_directive(3, &config), "trace");
    }

    #[test]
    fn test_logs_arguments() {
        let cli = Cli::try_parse_from([
            "allocfs", "logs", "a1", "web", "--type", "stderr", "-f", "--origin", "end",
            "--offset", "100", "--address", "10.0.0.1:4646",
        ])
        .unwrap();
        let Commands::Logs {
            target,
            alloc_id,
            task,
            log_type,
            follow,
            origin,
            offset,
            framed,
        } = cli.command
        else {
            panic!("expected logs command");
        };
        assert_eq!(alloc_id, "a1");
        assert_eq!(task, "web");
        assert_eq!(LogType::from(log_type), LogType::Stderr);
        assert!(follow);
        assert_eq!(Origin::from(origin), Origin::End);
        assert_eq!(offset, 100);
        assert!(!framed);
        assert_eq!(target.address.as_deref(), Some("10.0.0.1:4646"));
    }

    #[test]
    fn test_bad_log_type_is_rejected() {
        let parsed = Cli::try_parse_from(["allocfs", "logs", "a1", "web", "--type", "stdlog"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_client_defaults_to_configured_address() {
        let mut config = AppConfig::default();
        config.http.listen_port = 5000;
        let target = Target {
            address: None,
            token: None,
        };
        assert_eq!(client(&target, &config).addr(), "127.0.0.1:5000");
    }

    #[tokio::test]
    async fn test_load_config_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = load_config(&missing).await.unwrap();
        assert_eq!(config.http.listen_port, 4646);

        let present = dir.path().join("allocfs.toml");
        std::fs::write(&present, "[http]\nlisten_port = 7000\n").unwrap();
        let config = load_config(&present).await.unwrap();
        assert_eq!(config.http.listen_port, 7000);
    }
}
