//! Operator commands for the job queue.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use vsum_models::{JobId, Stage};
use vsum_queue::JobQueue;

#[derive(Parser)]
#[command(name = "vsum-admin", about = "Inspect and recover pipeline jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show per-stage job counts
    Stats,
    /// List dead-lettered jobs of a stage
    DeadLetters {
        #[arg(long, value_enum, default_value = "summarize")]
        stage: StageArg,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Re-enqueue a dead-lettered job with its attempt count reset
    Redrive {
        job_id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StageArg {
    Upload,
    Summarize,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Upload => Stage::Upload,
            StageArg::Summarize => Stage::Summarize,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let queue = JobQueue::from_env().context("failed to open job queue")?;

    match cli.command {
        Command::Stats => {
            println!(
                "{:<10} {:>8} {:>8} {:>8} {:>10}",
                "stage", "pending", "leased", "dead", "completed"
            );
            for stage in Stage::ALL {
                let stats = queue.stats(stage).await?;
                println!(
                    "{:<10} {:>8} {:>8} {:>8} {:>10}",
                    stage, stats.pending, stats.leased, stats.dead_lettered, stats.completed
                );
            }
        }
        Command::DeadLetters { stage, limit } => {
            let records = queue.dead_letters(stage.into(), limit).await?;
            if records.is_empty() {
                println!("no dead-lettered jobs");
            }
            for record in records {
                println!(
                    "{}  attempts={}/{}  updated={}  error={}",
                    record.id,
                    record.attempts,
                    record.max_attempts,
                    record.updated_at.to_rfc3339(),
                    record.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Redrive { job_id } => {
            let id = JobId::from_string(job_id);
            if queue.redrive(&id).await? {
                println!("re-enqueued {}", id);
            } else {
                anyhow::bail!("job {} is not dead-lettered", id);
            }
        }
    }
    Ok(())
}
