use anyhow::{anyhow, Result};
use candidate_mailbot::config::App;
use candidate_mailbot::db;
use candidate_mailbot::model::ProcessingStatus;
use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect processing records by status")]
struct Args {
    /// Path to YAML config file (reads only `app`)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only list records in this status (pending, classified, responded, failed, skipped)
    #[arg(long)]
    status: Option<String>,

    #[arg(long, default_value_t = 20)]
    limit: i64,
}

#[derive(Debug, serde::Deserialize)]
struct AppOnlyConfig {
    app: App,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let content = fs::read_to_string(&args.config)?;
    let cfg: AppOnlyConfig = serde_yaml::from_str(&content)?;

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    println!("status counts:");
    for count in db::status_counts(&pool).await? {
        println!("  {:<11} {}", count.status.as_str(), count.count);
    }

    let statuses = match args.status.as_deref() {
        Some(s) => vec![ProcessingStatus::parse_status(&s.to_ascii_lowercase())
            .ok_or_else(|| anyhow!("unknown status {s}"))?],
        None => vec![ProcessingStatus::Failed, ProcessingStatus::Classified],
    };

    for status in statuses {
        let records = db::list_by_status(&pool, status, args.limit).await?;
        println!("\n{} ({} shown):", status.as_str(), records.len());
        for r in records {
            println!(
                "  {} | {} | {} | attempts={}{} | intent={} | {}",
                r.message_id,
                r.updated_at.format("%Y-%m-%d %H:%M:%S"),
                r.message.sender_address,
                r.attempt_count,
                if r.terminal { " terminal" } else { "" },
                r.intent_label.map(|i| i.as_str()).unwrap_or("-"),
                r.error_detail.as_deref().unwrap_or(""),
            );
        }
    }
    Ok(())
}
