//! tally scan command implementation
//!
//! Runs a single pass over a transcript file and reports what it derived.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::engine::Engine;
use crate::entity::{Entity, EntityKind, EntityState};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput, OutputOptions};
use crate::transcript::JsonlTranscript;

pub struct ScanOptions {
    pub file: PathBuf,
    pub config: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
}

#[derive(Serialize)]
struct ScanReport {
    file: PathBuf,
    messages: usize,
    counts: BTreeMap<EntityKind, usize>,
    points_balance: i64,
    tasks: Vec<Entity>,
    inventory: Vec<Entity>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failed: Vec<String>,
}

pub fn run(opts: ScanOptions) -> Result<()> {
    if !opts.file.is_file() {
        return Err(Error::TranscriptNotFound(opts.file));
    }
    let config = Config::resolve(opts.config.as_deref())?;
    let source = Arc::new(JsonlTranscript::new(&opts.file));

    let (engine, pass) = super::runtime()?.block_on(async {
        let engine = Engine::new(source, config)?;
        let pass = engine.run_pass().await?;
        Ok::<_, Error>((engine, pass))
    })?;

    let snapshot = engine.snapshot();
    let report = ScanReport {
        file: opts.file.clone(),
        messages: pass.messages,
        counts: snapshot.counts(),
        points_balance: snapshot.points_balance(),
        tasks: snapshot.entities(EntityKind::Task),
        inventory: snapshot.entities(EntityKind::InventoryItem),
        failed: pass.failed.clone(),
    };

    let mut human = HumanOutput::new(format!(
        "tally scan: {} messages, {} entities",
        report.messages,
        snapshot.len()
    ));
    human.push_row("file", opts.file.display().to_string());
    for kind in EntityKind::ALL {
        let count = report.counts.get(&kind).copied().unwrap_or(0);
        human.push_row(kind.as_str(), count.to_string());
    }
    human.push_row("points balance", report.points_balance.to_string());
    for task in &report.tasks {
        human.push_line("Tasks", describe_task(task));
    }
    for item in &report.inventory {
        human.push_line("Inventory", describe_item(item));
    }
    for key in &report.failed {
        human.push_warning(format!("extractor '{key}' failed; its results were skipped"));
    }

    emit_success(
        OutputOptions {
            json: opts.json,
            quiet: opts.quiet,
        },
        "scan",
        &report,
        Some(&human),
    )?;

    Ok(())
}

fn describe_task(task: &Entity) -> String {
    let mut line = format!("{}  [{}]", task.id, task.state.status_label());
    if let Some(title) = task.field("title") {
        line.push_str("  ");
        line.push_str(title);
    }
    if let Some(reward) = task.field("reward") {
        line.push_str(&format!("  reward {reward}"));
    }
    line
}

fn describe_item(item: &Entity) -> String {
    match &item.state {
        EntityState::InventoryItem {
            count,
            used_quantity,
            ..
        } => format!(
            "{}  [{}]  x{}  used {}",
            item.id,
            item.state.status_label(),
            count,
            used_quantity
        ),
        _ => item.id.clone(),
    }
}
