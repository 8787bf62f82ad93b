use anyhow::{Context, Result};
use candidate_mailbot::classifier::OpenAiClassifier;
use candidate_mailbot::mailbox::GmailClient;
use candidate_mailbot::pipeline::{Pipeline, PipelineSettings};
use candidate_mailbot::{config, crm, db};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Process a single batch and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let mailbox = Arc::new(GmailClient::from_config(&cfg).context("failed to build Gmail client")?);
    let directory = crm::from_config(&cfg)?;
    let classifier =
        Arc::new(OpenAiClassifier::from_config(&cfg).context("failed to build classifier")?);

    let pipeline = Pipeline::new(
        pool,
        mailbox,
        directory,
        classifier,
        PipelineSettings::from_config(&cfg),
    );

    if args.once {
        let report = pipeline.process_batch().await?;
        info!(?report, "single batch done");
        return Ok(());
    }

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown requested; finishing claimed messages");
                shutdown.store(true, Ordering::SeqCst);
            }
        }
    });

    let poll_sleep = cfg.app.poll_interval();
    info!(interval_ms = cfg.app.poll_interval_ms, "starting candidate mail loop");
    while !shutdown.load(Ordering::SeqCst) {
        match pipeline.process_batch().await {
            Ok(_) => {}
            Err(err) => {
                error!(?err, "batch aborted");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        let mut waited = Duration::ZERO;
        while waited < poll_sleep && !shutdown.load(Ordering::SeqCst) {
            let step = (poll_sleep - waited).min(Duration::from_millis(250));
            tokio::time::sleep(step).await;
            waited += step;
        }
    }
    info!("stopped");
    Ok(())
}
