use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::domain::LoadOutcome;
use crate::error::Result;
use crate::pipeline::categorize::Categorizer;
use crate::pipeline::load::TransactionStore;
use crate::pipeline::normalize::{NormalizeOutcome, Normalizer};
use crate::pipeline::parser::XmlBatchParser;
use crate::pipeline::snapshot;

/// Run lifecycle. `Failed` is reachable only from `Parsing`; once records are
/// being processed, failures stay per-record and the run always finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Parsing,
    Processing,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunCounts {
    pub parsed: u64,
    pub inserted: u64,
    pub duplicate: u64,
    pub rejected: u64,
    pub filtered: u64,
    pub dead_lettered: u64,
}

/// One JSON object per invocation: source identity, timing, per-outcome
/// counts, and whether the run reached `Done` or `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub counts: RunCounts,
}

/// Drives one full pass: Parser -> Normalizer -> Categorizer -> Loader,
/// strictly one record at a time in source order. The runner owns all global
/// run state; the stages only ever see one record and the shared config.
pub struct PipelineRunner {
    config: PipelineConfig,
    input: PathBuf,
    db_path: PathBuf,
    manifest_path: PathBuf,
    snapshot_path: PathBuf,
}

impl PipelineRunner {
    pub fn new(
        config: PipelineConfig,
        input: PathBuf,
        db_path: PathBuf,
        manifest_path: Option<PathBuf>,
        snapshot_path: Option<PathBuf>,
    ) -> Self {
        let sibling = |name: &str| {
            db_path
                .parent()
                .map(|p| p.join(name))
                .unwrap_or_else(|| PathBuf::from(name))
        };
        let manifest_path = manifest_path.unwrap_or_else(|| sibling("run_manifest.json"));
        let snapshot_path = snapshot_path.unwrap_or_else(|| sibling("dashboard.json"));
        Self {
            config,
            input,
            db_path,
            manifest_path,
            snapshot_path,
        }
    }

    /// Runs the pipeline to completion. A fatal parse failure yields an
    /// `Ok` manifest in the `Failed` state (the manifest is the reporting
    /// channel); only environmental faults such as an unopenable database
    /// surface as `Err`.
    pub fn run(&self) -> Result<RunManifest> {
        let started_at = Utc::now();
        let ingested_at = started_at;
        let mut state = RunState::Idle;
        let mut counts = RunCounts::default();
        debug!(?state, "run created");

        let mut store = TransactionStore::open(&self.db_path)?;

        state = RunState::Parsing;
        debug!(?state, input = %self.input.display(), "run started");
        let records = match fs::read(&self.input).map_err(Into::into).and_then(|bytes| {
            XmlBatchParser::parse_bytes(&bytes)
        }) {
            Ok(records) => records,
            Err(e) => {
                state = RunState::Failed;
                error!(error = %e, "fatal parse failure, aborting run");
                store.append_audit(
                    "error",
                    "parse",
                    &format!("{}: {}", e.kind(), e),
                    None,
                )?;
                let manifest = self.finish_manifest(started_at, state, counts)?;
                return Ok(manifest);
            }
        };
        counts.parsed = records.len() as u64;

        state = RunState::Processing;
        debug!(?state, records = records.len(), "processing records");
        let normalizer = Normalizer::new(&self.config);
        let categorizer = Categorizer::new(&self.config);

        for raw in &records {
            match normalizer.normalize(raw, ingested_at) {
                NormalizeOutcome::Filtered { reason } => {
                    counts.filtered += 1;
                    debug!(index = raw.index, reason = %reason, "record filtered");
                }
                NormalizeOutcome::Rejected { error } => {
                    counts.rejected += 1;
                    let reason = format!("{}: {}", error.kind(), error);
                    warn!(index = raw.index, reason = %reason, "record rejected");
                    store.dead_letter("normalize", &reason, &serde_json::to_value(raw)?)?;
                    store.append_audit("warn", "normalize", &reason, None)?;
                }
                NormalizeOutcome::Normalized(normalized) => {
                    let categorized = categorizer.categorize(normalized);
                    match store.insert(&categorized) {
                        Ok(LoadOutcome::Inserted { id }) => {
                            counts.inserted += 1;
                            debug!(index = raw.index, id, "record inserted");
                        }
                        Ok(LoadOutcome::DuplicateSkipped) => {
                            counts.duplicate += 1;
                            debug!(index = raw.index, "record deduplicated");
                        }
                        Err(e) => {
                            counts.dead_lettered += 1;
                            let reason = format!("{}: {}", e.kind(), e);
                            warn!(index = raw.index, reason = %reason, "load fault, dead-lettering");
                            store.dead_letter("load", &reason, &serde_json::to_value(raw)?)?;
                            store.append_audit("error", "load", &reason, None)?;
                        }
                    }
                }
            }
        }

        state = RunState::Finalizing;
        debug!(?state, "finalizing run");
        snapshot::export(&store, &self.snapshot_path)?;

        state = RunState::Done;
        let manifest = self.finish_manifest(started_at, state, counts)?;
        info!(
            inserted = counts.inserted,
            duplicate = counts.duplicate,
            rejected = counts.rejected,
            filtered = counts.filtered,
            dead_lettered = counts.dead_lettered,
            "run complete"
        );
        Ok(manifest)
    }

    fn finish_manifest(
        &self,
        started_at: DateTime<Utc>,
        state: RunState,
        counts: RunCounts,
    ) -> Result<RunManifest> {
        let manifest = RunManifest {
            source: self.input.display().to_string(),
            started_at,
            finished_at: Utc::now(),
            state,
            counts,
        };
        write_manifest(&manifest, &self.manifest_path)?;
        Ok(manifest)
    }
}

fn write_manifest(manifest: &RunManifest, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_vec_pretty(manifest)?)?;
    info!(path = %path.display(), state = ?manifest.state, "wrote run manifest");
    Ok(())
}
