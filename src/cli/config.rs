//! tally config command implementation

use std::path::PathBuf;

use serde::Serialize;

use crate::config::{Config, CONFIG_FILE};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput, OutputOptions};

pub struct ConfigOptions {
    pub init: bool,
    pub config: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
}

#[derive(Serialize)]
struct ConfigReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<PathBuf>,
    config: Config,
}

pub fn run(opts: ConfigOptions) -> Result<()> {
    let (config, created) = if opts.init {
        let path = std::env::current_dir()?.join(CONFIG_FILE);
        if path.exists() {
            return Err(Error::InvalidArgument(format!(
                "{} already exists",
                path.display()
            )));
        }
        let config = Config::default();
        config.save(&path)?;
        (config, Some(path))
    } else {
        (Config::resolve(opts.config.as_deref())?, None)
    };

    // Surface bad durations here rather than at first use.
    config.timings()?;

    let header = match &created {
        Some(path) => format!("tally config: wrote {}", path.display()),
        None => "tally config".to_string(),
    };
    let mut human = HumanOutput::new(header);
    human.push_row("detector.debounce", config.detector.debounce.clone());
    human.push_row("detector.poll_interval", config.detector.poll_interval.clone());
    human.push_row("detector.allow", config.detector.allow.join(", "));
    human.push_row("detector.deny", config.detector.deny.join(", "));
    human.push_row("cache.max_age", config.cache.max_age.clone());
    human.push_row("cache.sweep_interval", config.cache.sweep_interval.clone());
    human.push_row("cache.max_entries", config.cache.max_entries.to_string());
    human.push_row("source.retry_attempts", config.source.retry_attempts.to_string());
    human.push_row("source.retry_backoff", config.source.retry_backoff.clone());

    let report = ConfigReport { created, config };
    emit_success(
        OutputOptions {
            json: opts.json,
            quiet: opts.quiet,
        },
        "config",
        &report,
        Some(&human),
    )
}
