//! Candidate generation-and-selection pipeline for card illustrations.
//!
//! A run resolves reference images per family, plans `N` candidates per
//! entity, generates them in batches, scores every candidate and promotes one
//! winner per entity to its final paths.

pub mod critique;
pub mod generation;
pub mod openai;
pub mod placeholder;
pub mod planner;
pub mod provider;
pub mod reference;
pub mod report;
pub mod scheduler;
pub mod selection;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use deckart_contracts::config::PipelineConfig;
use deckart_contracts::entities::EntityFamily;
use deckart_contracts::events::EventWriter;
use deckart_contracts::runs::summary::{write_summary, RunSummary, WinnerRecord};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::critique::{score_candidates, CritiqueSettings};
use crate::generation::{run_generation, GenerationOutcome};
use crate::planner::{plan, FamilyLayout, GenerationParams, Plan, PlanRequest, TaskRole};
use crate::reference::{
    accept_bootstrap, plan_bootstrap, resolve_user_references, Bootstrap, FamilyReferences,
    ReferenceSource,
};
use crate::report::Stage;
use crate::selection::{select_winners, RandomTieBreaker, Selection};

pub use crate::openai::{error_chain_text, OpenAiProvider};
pub use crate::provider::{AssetProvider, DryrunProvider};
pub use crate::report::Reporter;
pub use crate::selection::TieBreaker;

pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPreview {
    pub family: String,
    pub entities: usize,
    pub skipped: usize,
    pub tasks: usize,
    pub reused: usize,
    pub batches: usize,
    pub references: usize,
}

#[derive(Debug, Default)]
struct CycleOutcome {
    generation: GenerationOutcome,
    scored: usize,
    selections: Vec<Selection>,
}

pub struct Pipeline {
    config: PipelineConfig,
    provider: Arc<dyn AssetProvider>,
    reporter: Reporter,
    tie_breaker: Box<dyn TieBreaker>,
    out_dir: PathBuf,
    run_id: String,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn AssetProvider>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            provider,
            reporter: Reporter::new(),
            tie_breaker: Box::new(RandomTieBreaker::from_entropy()),
            out_dir: out_dir.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Mirrors reporter entries and pipeline progress to a JSONL event log.
    pub fn with_events(mut self, path: impl Into<PathBuf>) -> Self {
        self.reporter = Reporter::with_events(EventWriter::new(path, self.run_id.clone()));
        self
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_tie_breaker(mut self, tie_breaker: Box<dyn TieBreaker>) -> Self {
        self.tie_breaker = tie_breaker;
        self
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn family_layout(&self, family: &str) -> FamilyLayout {
        FamilyLayout::new(self.out_dir.join(family), self.config.extension())
    }

    pub fn plan_family(&self, family: &EntityFamily, references: &[PathBuf]) -> Plan {
        let layout = self.family_layout(&family.name);
        plan(
            PlanRequest {
                layout: &layout,
                entities: &family.entities,
                candidates: self.config.candidates,
                references,
                params: GenerationParams::from_config(&self.config),
                batch_size: self.config.batch_size,
                resume: self.config.resume,
                role: TaskRole::Card,
            },
            self.provider.as_ref(),
        )
    }

    /// Counts what a run would do. Only user references are considered;
    /// bootstrapped ones need the provider.
    pub fn preview(&self, families: &[EntityFamily]) -> Vec<PlanPreview> {
        families
            .iter()
            .map(|family| {
                let references = self
                    .config
                    .references
                    .get(&family.name)
                    .and_then(|spec| resolve_user_references(spec).ok())
                    .unwrap_or_default();
                let planned = self.plan_family(family, &references);
                PlanPreview {
                    family: family.name.clone(),
                    entities: family.entities.len(),
                    skipped: planned.skipped_entities.len(),
                    tasks: planned.tasks.len(),
                    reused: planned.reused_count(),
                    batches: planned.batches.len(),
                    references: references.len(),
                }
            })
            .collect()
    }

    /// Runs references, generation, critique and selection for every family
    /// and writes `summary.json` into the output directory. Per-candidate
    /// failures end up in the summary; only run-level IO errors are returned.
    pub async fn run(&mut self, families: &[EntityFamily]) -> Result<RunSummary> {
        let started_at = now_utc_iso();
        std::fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("failed to create {}", self.out_dir.display()))?;
        let entities_total: usize = families.iter().map(|f| f.entities.len()).sum();
        info!(
            run_id = %self.run_id,
            provider = self.provider.name(),
            families = families.len(),
            entities = entities_total,
            "run started"
        );
        self.reporter.event(
            "run_started",
            json!({
                "out_dir": self.out_dir.to_string_lossy(),
                "provider": self.provider.name(),
                "families": families.len(),
                "entities": entities_total,
            }),
        );

        let references = self.resolve_references(families).await;
        let mut planned = Plan::default();
        for (family, refs) in families.iter().zip(&references) {
            let family_plan = self.plan_family(family, &refs.paths);
            for id in &family_plan.duplicate_entities {
                self.reporter.warning(format!(
                    "duplicate entity '{id}' in family '{}'; keeping the first record",
                    family.name
                ));
            }
            planned.merge(family_plan);
        }
        self.reporter.event(
            "plan_ready",
            json!({
                "tasks": planned.tasks.len(),
                "batches": planned.batches.len(),
                "reused": planned.reused_count(),
                "skipped": planned.skipped_entities,
            }),
        );
        let outcome = self.cycle(&mut planned).await;

        let family_of: HashMap<PathBuf, &str> = families
            .iter()
            .map(|family| (self.out_dir.join(&family.name), family.name.as_str()))
            .collect();
        let winners = outcome
            .selections
            .iter()
            .map(|selection| WinnerRecord {
                family: selection
                    .final_paths
                    .first()
                    .and_then(|path| path.parent())
                    .and_then(|dir| family_of.get(dir).copied())
                    .unwrap_or_default()
                    .to_string(),
                entity_id: selection.entity_id.clone(),
                candidate_index: selection.candidate_index.unwrap_or(0),
                score: selection.score,
                final_paths: selection
                    .final_paths
                    .iter()
                    .map(|path| path.to_string_lossy().to_string())
                    .collect(),
            })
            .collect();

        let summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at,
            finished_at: now_utc_iso(),
            entities_total: entities_total as u64,
            entities_skipped: planned.skipped_entities.len() as u64,
            candidates_generated: outcome.generation.generated as u64,
            candidates_scored: outcome.scored as u64,
            winners,
            failures: self.reporter.summary(),
        };
        let summary_path = self.out_dir.join(SUMMARY_FILE);
        write_summary(&summary_path, &summary, Some(&self.summary_extra(&references)))
            .with_context(|| format!("failed to write {}", summary_path.display()))?;
        info!(
            run_id = %self.run_id,
            winners = summary.winners.len(),
            skipped = summary.entities_skipped,
            failures = summary.failures.total(),
            "run finished"
        );
        self.reporter.event(
            "run_finished",
            json!({"summary_path": summary_path.to_string_lossy()}),
        );
        Ok(summary)
    }

    /// User references first; families without any get a bootstrap cycle.
    /// All bootstraps share one generate, critique and select pass.
    async fn resolve_references(&mut self, families: &[EntityFamily]) -> Vec<FamilyReferences> {
        let mut resolved: Vec<FamilyReferences> = Vec::with_capacity(families.len());
        let mut bootstrap = Plan::default();
        let mut pending: Vec<(usize, PathBuf)> = Vec::new();

        for (idx, family) in families.iter().enumerate() {
            if let Some(spec) = self.config.references.get(&family.name) {
                match resolve_user_references(spec) {
                    Ok(paths) if !paths.is_empty() => {
                        info!(family = %family.name, count = paths.len(), "using user references");
                        resolved.push(FamilyReferences {
                            family: family.name.clone(),
                            paths,
                            source: ReferenceSource::User,
                        });
                        continue;
                    }
                    Ok(_) => self.reporter.warning(format!(
                        "no reference images matched '{spec}' for family '{}'",
                        family.name
                    )),
                    Err(err) => {
                        self.reporter
                            .failure(Stage::Reference, &family.name, format!("{err:#}"))
                    }
                }
            }

            let mut entry = FamilyReferences::unconditioned(&family.name);
            let layout = self.family_layout(&family.name);
            match plan_bootstrap(family, &layout, &self.config, self.provider.as_ref()) {
                Bootstrap::Existing(path) => {
                    entry.paths = vec![path];
                    entry.source = ReferenceSource::Existing;
                }
                Bootstrap::Planned(_) if self.plan_family(family, &[]).tasks.is_empty() => {
                    debug!(
                        family = %family.name,
                        "no card work left; reference bootstrap skipped"
                    );
                }
                Bootstrap::Planned(family_plan) => {
                    if let Some(target) = family_plan
                        .tasks
                        .first()
                        .and_then(|task| task.final_paths.first())
                    {
                        pending.push((idx, target.clone()));
                    }
                    bootstrap.merge(family_plan);
                }
                Bootstrap::Disabled => {}
            }
            resolved.push(entry);
        }

        if pending.is_empty() {
            return resolved;
        }
        let outcome = self.cycle(&mut bootstrap).await;
        for (idx, target) in pending {
            let selection = outcome
                .selections
                .iter()
                .find(|selection| selection.final_paths.first() == Some(&target));
            if let Some(path) = accept_bootstrap(&families[idx].name, selection, &self.reporter) {
                resolved[idx].paths = vec![path];
                resolved[idx].source = ReferenceSource::Bootstrapped;
            }
        }
        resolved
    }

    async fn cycle(&mut self, planned: &mut Plan) -> CycleOutcome {
        if planned.tasks.is_empty() {
            return CycleOutcome::default();
        }
        let generation = run_generation(
            planned,
            self.provider.as_ref(),
            &self.config.generation,
            &self.reporter,
        )
        .await;
        let settings = CritiqueSettings {
            model: &self.config.critique_model,
            limits: &self.config.critique,
        };
        let scores =
            score_candidates(planned, self.provider.as_ref(), &settings, &self.reporter).await;
        let scored = scores.iter().filter(|r| r.score.is_judged()).count();
        let selections = select_winners(
            planned,
            &scores,
            self.config.keep,
            self.tie_breaker.as_mut(),
            &self.reporter,
        );
        CycleOutcome {
            generation,
            scored,
            selections,
        }
    }

    fn summary_extra(&self, references: &[FamilyReferences]) -> Map<String, Value> {
        let mut refs = Map::new();
        for entry in references {
            refs.insert(
                entry.family.clone(),
                json!({
                    "source": entry.source.as_str(),
                    "paths": entry
                        .paths
                        .iter()
                        .map(|path| path.to_string_lossy())
                        .collect::<Vec<_>>(),
                }),
            );
        }
        let mut extra = Map::new();
        extra.insert("provider".to_string(), json!(self.provider.name()));
        extra.insert("references".to_string(), Value::Object(refs));
        extra.insert("warnings".to_string(), json!(self.reporter.warnings()));
        extra
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
