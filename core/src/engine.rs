//! The key engine: one run from source rows to committed keys.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Ingest and normalize the four record sets.
//!   2. Load each enabled mode's prior snapshot and key high-water mark.
//!   3. Per mode: build graph, resolve components, reconcile keys.
//!   4. Stage exports (if an output directory is configured).
//!   5. Commit every mode in one store transaction.
//!   6. Rename staged exports into place.
//!
//! RULES:
//!   - Any error before step 5 completes leaves the store and the output
//!     directory exactly as they were.
//!   - After step 5 the run has succeeded. A failed rename in step 6 is
//!     logged and leaves that mode's `export` empty.
//!   - Step 3 runs one scoped thread per mode; modes share only read-only
//!     inputs.
//!   - `as_of` is always supplied by the caller.

use crate::{
    config::{R360Config, ReconcileMode},
    error::{R360Error, R360Result},
    graph::{build_graph, Exclusions, GraphStats},
    ingest::{ingest, IngestStats, RecordSet},
    publish::{stage_export, StagedExport},
    reconcile::{reconcile, KeyPlan, PriorSnapshot, ReconcileStats},
    resolver::resolve,
    source::RecordSource,
    store::{KeyStore, RunCommit},
    types::{Mode, RunId, AS_OF_FORMAT},
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::thread;

/// Per-mode outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeReport {
    pub mode:        Mode,
    pub reconcile:   ReconcileMode,
    pub unique_keys: usize,
    pub graph:       GraphStats,
    pub keys:        ReconcileStats,
    pub export:      Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id:    RunId,
    pub as_of:     String,
    pub committed: bool,
    pub ingest:    IngestStats,
    pub modes:     Vec<ModeReport>,
}

/// Computed but not yet committed result of a run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: RunId,
    pub as_of:  NaiveDateTime,
    pub ingest: IngestStats,
    pub modes:  Vec<(ModeReport, KeyPlan)>,
}

impl RunPlan {
    pub fn plan(&self, mode: Mode) -> Option<&KeyPlan> {
        self.modes.iter().find(|(r, _)| r.mode == mode).map(|(_, p)| p)
    }

    fn report(&self, committed: bool) -> RunReport {
        RunReport {
            run_id:    self.run_id.clone(),
            as_of:     self.as_of.format(AS_OF_FORMAT).to_string(),
            committed,
            ingest:    self.ingest.clone(),
            modes:     self.modes.iter().map(|(r, _)| r.clone()).collect(),
        }
    }
}

pub struct KeyEngine<K: KeyStore> {
    config: R360Config,
    store:  K,
}

impl<K: KeyStore> KeyEngine<K> {
    pub fn new(config: R360Config, store: K) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &R360Config {
        &self.config
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut K {
        &mut self.store
    }

    pub fn into_store(self) -> K {
        self.store
    }

    /// Steps 1 to 3: everything short of writing.
    pub fn plan(&self, source: &dyn RecordSource, as_of: NaiveDateTime) -> R360Result<RunPlan> {
        let modes = self.config.enabled_modes();
        if modes.is_empty() {
            return Err(R360Error::Config("no mode is enabled".into()));
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        log::info!(
            "Run {run_id} as of {} for {:?}",
            as_of.format(AS_OF_FORMAT),
            modes.iter().map(Mode::as_str).collect::<Vec<_>>()
        );

        let records = ingest(source, &self.config)?;

        let mut inputs = Vec::with_capacity(modes.len());
        for mode in modes {
            let mc = self.config.mode(mode);
            let prior = match mc.reconcile {
                ReconcileMode::Historical => self.store.load_prior(mode)?,
                ReconcileMode::Fresh => {
                    log::info!("{mode}: fresh reconcile, prior keys ignored");
                    None
                }
            };
            let high_water = self.store.key_high_water(mode)?;
            inputs.push((mode, mc.reconcile, prior, high_water));
        }

        let planned: Vec<R360Result<(ModeReport, KeyPlan)>> = thread::scope(|s| {
            let handles: Vec<_> = inputs
                .iter()
                .map(|(mode, reconcile, prior, high_water)| {
                    let records = &records;
                    let config = &self.config;
                    let handle = s.spawn(move || {
                        plan_mode(records, config, *mode, *reconcile, prior.as_ref(), *high_water)
                    });
                    (*mode, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(mode, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(anyhow::anyhow!("{mode} planning thread panicked").into())
                    })
                })
                .collect()
        });

        Ok(RunPlan {
            run_id,
            as_of,
            ingest: records.stats,
            modes: planned.into_iter().collect::<R360Result<_>>()?,
        })
    }

    /// Full run: plan, stage exports, commit, publish exports.
    pub fn run(&mut self, source: &dyn RecordSource, as_of: NaiveDateTime) -> R360Result<RunReport> {
        let mut plan = self.plan(source, as_of)?;
        let staged = self.stage_exports(&plan)?;

        let commit = RunCommit {
            run_id: plan.run_id.clone(),
            as_of,
            plans:  plan.modes.iter().map(|(_, p)| p.clone()).collect(),
        };
        if let Err(e) = self.store.commit_run(&commit) {
            log::error!("Run {} failed to commit: {e}", plan.run_id);
            staged.into_iter().for_each(StagedExport::discard);
            return Err(e);
        }

        finalize_exports(&mut plan, staged);
        Ok(plan.report(true))
    }

    /// Plan and export without touching the store.
    pub fn dry_run(&self, source: &dyn RecordSource, as_of: NaiveDateTime) -> R360Result<RunReport> {
        let mut plan = self.plan(source, as_of)?;
        let staged = self.stage_exports(&plan)?;
        finalize_exports(&mut plan, staged);
        log::info!("Run {} was a dry run; nothing committed", plan.run_id);
        Ok(plan.report(false))
    }

    fn stage_exports(&self, plan: &RunPlan) -> R360Result<Vec<StagedExport>> {
        let Some(dir) = self.config.output_dir.as_deref() else {
            return Ok(Vec::new());
        };
        let mut staged = Vec::with_capacity(plan.modes.len());
        for (_, key_plan) in &plan.modes {
            // An early return drops what was staged so far, which removes it.
            staged.push(stage_export(Path::new(dir), key_plan, plan.as_of)?);
        }
        Ok(staged)
    }
}

fn plan_mode(
    records: &RecordSet,
    config: &R360Config,
    mode: Mode,
    reconcile_mode: ReconcileMode,
    prior: Option<&PriorSnapshot>,
    high_water: u64,
) -> R360Result<(ModeReport, KeyPlan)> {
    let exclusions = Exclusions::from(&config.mode(mode));
    let graph = build_graph(records, mode, &exclusions, config.address_match);
    let partition = resolve(&graph);
    let plan = reconcile(&partition, prior, high_water)?;
    let report = ModeReport {
        mode,
        reconcile:   reconcile_mode,
        unique_keys: plan.unique_keys(),
        graph:       graph.stats,
        keys:        plan.stats.clone(),
        export:      None,
    };
    Ok((report, plan))
}

/// Publish staged exports. Runs after the commit, so a failed rename is
/// reported on its mode (`export: None`) instead of failing the run.
fn finalize_exports(plan: &mut RunPlan, staged: Vec<StagedExport>) {
    for export in staged {
        let mode = export.mode;
        let target = export.target().to_path_buf();
        match export.finalize() {
            Ok(path) => {
                if let Some((report, _)) = plan.modes.iter_mut().find(|(r, _)| r.mode == mode) {
                    report.export = Some(path);
                }
            }
            Err(e) => log::error!(
                "Run {}: {mode} export to {} failed: {e}",
                plan.run_id,
                target.display()
            ),
        }
    }
}
