//! tally watch command implementation
//!
//! Runs the engine with a file watch plus polling and streams delta events
//! until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::detector::{FileWatchSource, MutationFilter};
use crate::engine::{Engine, Stats};
use crate::error::{Error, Result};
use crate::events::EventDestination;
use crate::output::{emit_success, HumanOutput, OutputOptions};
use crate::transcript::JsonlTranscript;

pub struct WatchOptions {
    pub file: PathBuf,
    pub events: Option<String>,
    pub config: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
}

pub fn run(opts: WatchOptions) -> Result<()> {
    if !opts.file.is_file() {
        return Err(Error::TranscriptNotFound(opts.file));
    }
    let config = Config::resolve(opts.config.as_deref())?;
    let filter = MutationFilter::from_config(&config.detector)?;
    let destination =
        EventDestination::parse(opts.events.as_deref()).unwrap_or(EventDestination::Stdout);
    let events_to_stdout = destination == EventDestination::Stdout;
    let mut sink = destination.open()?;

    let source = Arc::new(JsonlTranscript::new(&opts.file));
    let push = FileWatchSource::new(&opts.file, filter);

    let (stats, push_attached) = super::runtime()?.block_on(async {
        let engine = Engine::new(source, config)?;
        let mut reports = engine.subscribe();
        let handle = engine.start(Some(Box::new(push))).await?;
        let push_attached = handle.push_attached();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("interrupted");
                    break;
                }
                report = reports.recv() => match report {
                    Ok(report) => {
                        if !report.is_noop() || !report.failed.is_empty() {
                            sink.emit_pass(&report)?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event stream lagged; passes dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        let stats = engine.stats();
        handle.shutdown().await;
        Ok::<(Stats, bool), Error>((stats, push_attached))
    })?;

    if events_to_stdout {
        return Ok(());
    }

    let mut human = HumanOutput::new(format!("tally watch: stopped after {} passes", stats.passes));
    human.push_row("file", opts.file.display().to_string());
    human.push_row("entities", stats.entities.to_string());
    human.push_row("cache entries", stats.cache_size.to_string());
    if !push_attached {
        human.push_warning("file watch unavailable; ran on polling only");
    }

    emit_success(
        OutputOptions {
            json: opts.json,
            quiet: opts.quiet,
        },
        "watch",
        &stats,
        Some(&human),
    )
}
