use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use devotional_pipeline::auth::{require_admin, Gate};
use devotional_pipeline::config;
use devotional_pipeline::generator::GeminiClient;
use devotional_pipeline::pipeline::Pipeline;
use devotional_pipeline::store::Store;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Generate content for every calendar entry that is due, then exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Keep running, checking for due entries every `app.poll_interval_ms`
    #[arg(long)]
    watch: bool,

    /// Exit non-zero when any format failed to generate or a due entry was skipped
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = Store::connect(&cfg.database_url()).await?;
    let gate = Gate::from_config(store.clone(), &cfg);
    gate.reap().await?;

    let generator = GeminiClient::from_config(&cfg)?;
    let pipeline = Pipeline::new(store, Arc::new(generator));
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    info!(watch = args.watch, "starting pipeline runner");

    let mut total_items = 0usize;
    let mut total_failures = 0usize;
    let mut total_skipped = 0usize;

    loop {
        // Re-read each round so a sign-out elsewhere stops the runner.
        let session = gate.current_session().await?;
        if let Err(err) = require_admin(session.as_ref()) {
            bail!("pipeline runner needs a signed-in admin: {err}");
        }

        let today = Utc::now().date_naive();
        match pipeline.process_due(session.as_ref(), today).await {
            Ok(run) => {
                for report in &run.expanded {
                    total_items += report.items.len();
                    total_failures += report.failures.len();
                    for failure in &report.failures {
                        warn!(
                            entry_id = %report.entry_id,
                            item_id = %failure.item_id,
                            format = %failure.format,
                            error = %failure.message,
                            "format failed; regenerate it with `retry <item>`"
                        );
                    }
                }
                for (entry_id, err) in &run.skipped {
                    warn!(%entry_id, error = %err, "due entry left on the calendar");
                }
                total_skipped += run.skipped.len();
                if !run.expanded.is_empty() {
                    info!(entries = run.expanded.len(), "due entries expanded");
                }
            }
            Err(err) => {
                error!(?err, "error processing due entries");
                if !args.watch {
                    return Err(err.into());
                }
            }
        }

        if !args.watch {
            break;
        }
        tokio::time::sleep(poll_sleep).await;
    }

    info!(
        items = total_items,
        failures = total_failures,
        skipped = total_skipped,
        "pipeline runner finished"
    );
    if args.strict && total_failures > 0 {
        bail!("{total_failures} format(s) failed to generate");
    }
    if args.strict && total_skipped > 0 {
        bail!("{total_skipped} due entr(ies) could not be expanded");
    }
    Ok(())
}
