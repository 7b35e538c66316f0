use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;

use jobstore::cli::{Cli, Command};
use jobstore::config::Config;
use jobstore::{Job, JobStatus, JobStatusDoc, JobStore, SqliteStore};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    Ok(())
}

fn colored_status(status: JobStatus) -> ColoredString {
    match status {
        JobStatus::Pending => status.as_str().yellow(),
        JobStatus::InProgress => status.as_str().cyan(),
        JobStatus::Completed => status.as_str().green(),
        JobStatus::Failed => status.as_str().red(),
    }
}

fn print_doc(doc: &JobStatusDoc) {
    println!("{} {}", "Job:".bold(), doc.id.cyan());
    println!("  Name:     {}", doc.name);
    println!("  Score:    {}", doc.score);
    println!("  Status:   {}", colored_status(doc.status));
    println!("  Created:  {}", doc.created_at.to_rfc3339());
    if let Some(started) = doc.started_at {
        println!("  Started:  {}", started.to_rfc3339());
    }
    if let Some(finished) = doc.finished_at {
        println!("  Finished: {}", finished.to_rfc3339());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let store_path = cli.store.unwrap_or(config.store_path);

    info!("jobstore opening {}", store_path.display());
    let store = SqliteStore::open(&store_path)
        .context(format!("Failed to open job store at {}", store_path.display()))?;

    match cli.command {
        Command::Add { name, score } => {
            if name.trim().is_empty() {
                eyre::bail!("Job name must not be empty");
            }
            if !score.is_finite() {
                eyre::bail!("Score must be a finite number");
            }
            let id = uuid::Uuid::now_v7().to_string();
            store.add(&Job::new(&id, name, score)).await?;
            println!("{} Added job: {}", "✓".green(), id.cyan());
        }
        Command::Status { id } => {
            let doc = store.get_status(&id).await?;
            print_doc(&doc);
        }
        Command::List { status } => {
            let docs = store.list(status).await?;
            if docs.is_empty() {
                println!("No jobs found");
            } else {
                for doc in docs {
                    println!(
                        "{} {:<11} {:>10} {}",
                        doc.id.cyan(),
                        colored_status(doc.status),
                        doc.score.to_string().dimmed(),
                        doc.name
                    );
                }
            }
        }
        Command::Claim => match store.claim_next().await? {
            Some(job) => {
                println!("{} Claimed job: {}", "✓".green(), job.id.cyan());
                print_doc(&job.status_doc());
            }
            None => println!("No pending jobs"),
        },
    }

    Ok(())
}
