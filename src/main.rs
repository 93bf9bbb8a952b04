use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kgrag::{AgentState, BuildStatus, Config, KnowledgeService};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "kgrag")]
#[command(version, about = "Knowledge-graph retrieval over a relational database")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the graph and vector index from a database (sqlite://path or a path)
    Build {
        connection: String,
        /// Seconds between health polls while the build runs
        #[arg(long, default_value_t = 1)]
        poll_secs: u64,
    },
    /// Ask a question
    Chat {
        query: String,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Readiness and last build outcome
    Health,
    /// Node and relationship counts
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.kgrag.log_level.as_str()),
    )
    .init();

    log::debug!("Graph store: {}", config.graph_db_path().display());
    log::debug!("Index directory: {}", config.index_dir().display());

    let service = KnowledgeService::open(config)
        .await
        .context("Failed to open knowledge service")?;

    match args.command {
        Command::Build {
            connection,
            poll_secs,
        } => run_build(&service, &connection, poll_secs).await,
        Command::Chat { query, json } => run_chat(&service, &query, json).await,
        Command::Health => {
            println!("{}", serde_json::to_string_pretty(&service.health())?);
            Ok(())
        }
        Command::Stats => {
            let stats = service.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

async fn run_build(service: &KnowledgeService, connection: &str, poll_secs: u64) -> Result<()> {
    let ack = service.trigger_build(connection);
    if !ack.accepted {
        anyhow::bail!("Build rejected: {}", ack.message);
    }
    log::info!("Build {} accepted", ack.build_id);

    let health = loop {
        tokio::time::sleep(Duration::from_secs(poll_secs.max(1))).await;
        let health = service.health();
        if !health.building {
            break health;
        }
        log::info!("Building...");
    };

    let last = health
        .last_build
        .context("Build finished without recording an outcome")?;
    match last.status {
        BuildStatus::Succeeded => {
            println!("{}", serde_json::to_string_pretty(&last.report)?);
            Ok(())
        }
        _ => {
            let error = last.error.map(|e| format!("[{}] {}", e.kind, e.message));
            anyhow::bail!("Build failed: {}", error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

async fn run_chat(service: &KnowledgeService, query: &str, json: bool) -> Result<()> {
    let response = service.chat(query).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.answer);
        if !response.tools_used.is_empty() {
            println!("\nTools: {}", response.tools_used.join(", "));
        }
        for (i, source) in response.sources.iter().enumerate() {
            println!("[{}] {}: {}", i + 1, source.tool, source.excerpt);
        }
    }

    if response.status == AgentState::Failed {
        let error = response.error.map(|e| format!("[{}] {}", e.kind, e.message));
        anyhow::bail!("Query failed: {}", error.unwrap_or_else(|| "unknown error".to_string()));
    }
    Ok(())
}
