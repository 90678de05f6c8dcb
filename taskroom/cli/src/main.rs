//! TaskRoom CLI - Follow Agent Tasks From the Terminal
//!
//! Creates tasks, streams their progress and forwards instructions typed on
//! stdin while they run.
//!
//! # Usage
//!
//! ```bash
//! # Create a task, join its room, start it and follow it
//! taskroom run "write a short post about tide pools"
//!
//! # Follow a task that is already running
//! taskroom watch agent_1a2b3c4d
//!
//! # Inspect or stop a task
//! taskroom status agent_1a2b3c4d
//! taskroom cancel agent_1a2b3c4d
//!
//! # Against a deployed server, with verbose logging
//! RUST_LOG=debug taskroom --mode production --url https://tasks.example.com run "..."
//! ```
//!
//! The transcript goes to stdout; logs and status changes go to stderr.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use taskroom_core::{
    default_config_path, load_config_from_path, AssemblerOutput, Client, ClientConfig,
    ConfigOverrides, EnvironmentMode, Message, StreamKind, TaskApi, TaskId, TaskSession,
    TaskStatus,
};

/// TaskRoom - follow agent tasks over a live connection
#[derive(Parser, Debug)]
#[command(name = "taskroom")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server address (overrides mode and config)
    #[arg(short = 'u', long, global = true, value_name = "URL")]
    url: Option<String>,

    /// Environment mode: development or production
    #[arg(short = 'm', long, global = true, value_parser = parse_mode)]
    mode: Option<EnvironmentMode>,

    /// Configuration file path
    #[arg(short = 'c', long, global = true, env = "TASKROOM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Treat missing room acknowledgments as errors
    #[arg(long, global = true)]
    strict_acks: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true, env = "TASKROOM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a task, join its room, start it and follow it
    Run {
        /// What the agent should work on
        topic: String,

        /// Image references to attach
        #[arg(long = "image", value_name = "URL")]
        images: Vec<String>,

        /// Create and join without starting
        #[arg(long)]
        no_start: bool,
    },
    /// Follow an existing task
    Watch {
        /// Task to follow
        task_id: String,
    },
    /// Cancel a task
    Cancel {
        /// Task to cancel
        task_id: String,
    },
    /// Show a task's server-side status
    Status {
        /// Task to inspect
        task_id: String,
    },
}

fn parse_mode(s: &str) -> Result<EnvironmentMode, String> {
    s.parse()
}

/// Initialize logging to stderr
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("taskroom={level},taskroom_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Merge file, environment and flags into one configuration
fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let path = cli.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(url) = &cli.url {
        overrides = overrides.with_url(url.clone());
    }
    if let Some(mode) = cli.mode {
        overrides = overrides.with_mode(mode);
    }
    if cli.strict_acks {
        overrides = overrides.with_ack_tolerant(false);
    }
    overrides.apply(&mut config);

    info!(source = %config.source(), "Configuration loaded");
    Ok(config)
}

fn task_api(config: &ClientConfig) -> Result<TaskApi> {
    let Some(base) = config.transport.resolve_url() else {
        bail!("No server address: production mode needs --url or TASKROOM_ORIGIN");
    };
    TaskApi::new(base).context("Failed to build HTTP client")
}

// ============================================================================
// Rendering
// ============================================================================

/// Writes assembler output as a plain transcript
#[derive(Default)]
struct Transcript {
    /// A response is being printed token by token
    streaming: bool,
}

impl Transcript {
    fn render(&mut self, outputs: &[AssemblerOutput]) -> Result<()> {
        let mut out = std::io::stdout().lock();
        for output in outputs {
            match output {
                AssemblerOutput::Update(update) if update.kind == StreamKind::Response => {
                    write!(out, "{}", update.fragment)?;
                    self.streaming = true;
                }
                AssemblerOutput::Update(_) | AssemblerOutput::TransitionRejected { .. } => {}
                AssemblerOutput::Message(Message::Response { .. }) if self.streaming => {
                    writeln!(out)?;
                    self.streaming = false;
                }
                AssemblerOutput::Message(message) => {
                    if self.streaming {
                        writeln!(out)?;
                        self.streaming = false;
                    }
                    writeln!(out, "{}", message.summary())?;
                }
                AssemblerOutput::Status { to, .. } => {
                    eprintln!("{} {}", to.icon(), to.label());
                }
            }
        }
        out.flush()?;
        Ok(())
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Print the session until the task finishes, forwarding stdin lines as
/// instructions
async fn follow(session: &mut TaskSession, api: &TaskApi) -> Result<()> {
    let mut transcript = Transcript::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    while !session.status().is_terminal() {
        tokio::select! {
            outputs = session.next() => {
                let Some(outputs) = outputs else {
                    warn!("Event stream ended");
                    break;
                };
                transcript.render(&outputs)?;
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(text) if !text.trim().is_empty() => {
                        match session.send_instruction(text.trim()).await {
                            Ok(_) => eprintln!("📨 instruction accepted"),
                            Err(e) => eprintln!("⚠️ {e}"),
                        }
                    }
                    Some(_) => {}
                    None => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling {}", session.task_id());
                if let Err(e) = api.cancel(session.task_id()).await {
                    warn!(error = %e, "Cancel request failed");
                }
                break;
            }
        }
    }

    let outputs = session.drain();
    transcript.render(&outputs)?;
    Ok(())
}

fn finish(session: &TaskSession) -> Result<()> {
    let task = session.task();
    match task.status {
        TaskStatus::Error => bail!(
            "Task {} failed: {}",
            task.task_id,
            task.error.as_deref().unwrap_or("unknown error")
        ),
        TaskStatus::Complete => {
            if let Some(output) = &task.output {
                info!(task_id = %task.task_id, bytes = output.len(), "Task output received");
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn run_task(
    config: ClientConfig,
    topic: &str,
    images: &[String],
    no_start: bool,
) -> Result<()> {
    let api = task_api(&config)?;
    let ack = api.init(topic, images).await.context("Failed to create task")?;
    eprintln!("Task {} created", ack.task_id);

    let client = Client::from_config(config).context("Failed to set up transport")?;
    let mut session = client
        .open_session(ack.task_id.clone())
        .await
        .context("Failed to join the task room")?;

    if no_start {
        eprintln!("Joined {}; start it with the task API when ready", ack.task_id);
    } else {
        session.begin();
        api.start(&ack.task_id)
            .await
            .context("Failed to start task")?;
    }

    follow(&mut session, &api).await?;
    let result = finish(&session);
    session.close().await;
    client.connection().disconnect().await?;
    result
}

async fn watch_task(config: ClientConfig, task_id: TaskId) -> Result<()> {
    let api = task_api(&config)?;
    let report = api.status(&task_id).await.context("Failed to look up task")?;
    eprintln!("{} is {}", report.task_id, report.status);
    if report.task_status().is_terminal() {
        return Ok(());
    }

    let client = Client::from_config(config).context("Failed to set up transport")?;
    let mut session = client
        .open_session(task_id)
        .await
        .context("Failed to join the task room")?;

    follow(&mut session, &api).await?;
    let result = finish(&session);
    session.close().await;
    client.connection().disconnect().await?;
    result
}

async fn cancel_task(config: ClientConfig, task_id: TaskId) -> Result<()> {
    let api = task_api(&config)?;
    let ack = api.cancel(&task_id).await.context("Failed to cancel task")?;
    println!("{} {}", ack.task_id, ack.status);
    Ok(())
}

async fn show_status(config: ClientConfig, task_id: TaskId) -> Result<()> {
    let api = task_api(&config)?;
    let report = api.status(&task_id).await.context("Failed to fetch status")?;
    let status = report.task_status();

    println!("task:     {}", report.task_id);
    println!("status:   {} {} ({})", status.icon(), status.label(), report.status);
    println!("progress: {}%", report.progress);
    if let Some(step) = &report.current_step {
        println!("step:     {step}");
    }
    if let Some(error) = &report.error {
        println!("error:    {error}");
    }
    if let Some(result) = &report.result {
        let rendered = serde_json::to_string_pretty(result).context("Failed to render result")?;
        println!("result:\n{rendered}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = build_config(&cli)?;
    match cli.command {
        Command::Run {
            topic,
            images,
            no_start,
        } => run_task(config, &topic, &images, no_start).await,
        Command::Watch { task_id } => watch_task(config, TaskId::new(task_id)).await,
        Command::Cancel { task_id } => cancel_task(config, TaskId::new(task_id)).await,
        Command::Status { task_id } => show_status(config, TaskId::new(task_id)).await,
    }
}
