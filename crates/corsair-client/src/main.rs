//! Corsair operator CLI
//!
//! Interactive shell by default; one-shot subcommands for scripting and
//! tool-calling agents.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::info;

use corsair_client::Client;
use corsair_client::bridge::Invocation;
use corsair_client::dispatch::TaskCallbacks;
use corsair_client::script::load_pipeline;
use corsair_client::shell::Shell;
use corsair_core::config::{Config, ConfigSource, resolve_config};
use corsair_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "corsair")]
#[command(version, about = "Corsair operator client", long_about = None)]
struct Cli {
    /// Extra config file layered over the global one
    #[arg(short, long, env = "CORSAIR_CONFIG")]
    config: Option<PathBuf>,

    /// Teamserver address (overrides config)
    #[arg(long)]
    server: Option<String>,

    /// Operator token (overrides config)
    #[arg(long)]
    token: Option<String>,

    /// Log level for corsair targets (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive shell (default)
    Shell,
    /// List sessions and exit
    Sessions,
    /// Run one function
    Exec {
        /// Function name or alias
        name: String,
        /// Arguments, as typed in the shell
        args: Vec<String>,
        /// Target session
        #[arg(short, long)]
        session: Option<String>,
        /// Wait for the result and print it
        #[arg(short, long)]
        wait: bool,
    },
    /// Run a JSON pipeline file
    Script {
        /// Pipeline file
        file: PathBuf,
    },
    /// Print tool descriptors as JSON
    Tools,
    /// Call one tool with JSON arguments
    CallTool {
        /// Tool name
        name: String,
        /// Arguments object, e.g. '{"command_line": "/etc/hosts"}'
        #[arg(default_value = "{}")]
        arguments: String,
    },
}

/// Fold CLI flags over the loaded config. Returns whether any flag applied.
fn apply_cli_overrides(config: &mut Config, cli: &Cli) -> bool {
    let mut applied = false;
    if let Some(server) = &cli.server {
        config.server.addr.clone_from(server);
        applied = true;
    }
    if let Some(token) = &cli.token {
        config.server.token = Some(token.clone());
        applied = true;
    }
    if let Some(level) = &cli.log_level {
        config.log.level.clone_from(level);
        applied = true;
    }
    if cli.log_json {
        config.log.json = true;
        applied = true;
    }
    applied
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, mut source) =
        resolve_config(cli.config.as_deref(), |key| std::env::var(key).ok())?;
    if apply_cli_overrides(&mut config, &cli) {
        source = ConfigSource::Cli;
    }
    init_tracing(&default_filter(&config.log.level), config.log.json);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server.addr,
        config_source = ?source,
        "Starting corsair"
    );

    let client = Arc::new(Client::connect(&config).await?);
    client.start().await?;

    let result = run(&client, cli.command.unwrap_or(Commands::Shell)).await;
    client.shutdown().await;
    result
}

async fn run(client: &Arc<Client>, command: Commands) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match command {
        Commands::Shell => Shell::new(Arc::clone(client)).run().await?,
        Commands::Sessions => {
            Shell::new(Arc::clone(client))
                .execute_line("sessions", &mut out)
                .await?;
        }
        Commands::Exec {
            name,
            args,
            session,
            wait,
        } => {
            let bridge = client.bridge();
            if wait {
                let rendered = bridge
                    .invoke_sync(&name, Invocation::Cli(args), session.as_deref())
                    .await?;
                writeln!(out, "{}", rendered.text)?;
            } else {
                let (tx, rx) = oneshot::channel();
                let callbacks = TaskCallbacks::new()
                    .on_done(|ev| {
                        let (cur, total) = ev.progress();
                        let _ = writeln!(io::stdout(), "task {} {cur}/{total}", ev.task.task_id);
                    })
                    .on_finish(move |ev| {
                        let _ = tx.send(ev.clone());
                    });
                let task = bridge
                    .invoke_with(&name, Invocation::Cli(args), session.as_deref(), callbacks)
                    .await?;
                writeln!(
                    out,
                    "Task {} ({}) submitted on {}",
                    task.task_id, task.r#type, task.session_id
                )?;
                let event = tokio::time::timeout(client.dispatcher().wait_timeout(), rx).await??;
                if event.is_cancelled() {
                    writeln!(out, "task {} cancelled", task.task_id)?;
                } else if let Some(err) = &event.error {
                    anyhow::bail!("task {} failed: {err}", task.task_id);
                } else {
                    let spite = event.spite.unwrap_or_default();
                    let rendered = client.functions().render(&task.r#type, &spite)?;
                    writeln!(out, "{}", rendered.text)?;
                }
            }
        }
        Commands::Script { file } => {
            let pipeline = load_pipeline(&file)?;
            let reports = client.script_host().run_pipeline(&pipeline).await;
            let mut failed = 0;
            for report in &reports {
                match &report.outcome {
                    Ok(text) => writeln!(out, "[{}] {text}", report.call)?,
                    Err(e) => {
                        failed += 1;
                        writeln!(out, "[{}] error: {e}", report.call)?;
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {} steps failed", reports.len());
            }
        }
        Commands::Tools => {
            let tools = client.tool_bridge().tools();
            writeln!(out, "{}", serde_json::to_string_pretty(&tools)?)?;
        }
        Commands::CallTool { name, arguments } => {
            let arguments: serde_json::Value = serde_json::from_str(&arguments)?;
            let output = client.tool_bridge().call(&name, &arguments).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&output)?)?;
        }
    }
    Ok(())
}
