use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::{debug, info};

use crate::critique::{Score, ScoreRecord};
use crate::placeholder::{artifact_exists, is_placeholder, write_artifact, write_placeholder};
use crate::planner::{CandidateTask, Plan};
use crate::report::{Reporter, Stage};

pub trait TieBreaker: Send {
    /// Returns an index in `0..count`. `count` is never zero.
    fn pick(&mut self, count: usize) -> usize;
}

pub struct RandomTieBreaker<R = StdRng> {
    rng: R,
}

impl RandomTieBreaker<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl<R: Rng + Send> RandomTieBreaker<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng + Send> TieBreaker for RandomTieBreaker<R> {
    fn pick(&mut self, count: usize) -> usize {
        if count <= 1 {
            return 0;
        }
        self.rng.gen_range(0..count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub entity_id: String,
    /// Position of the winning task in [`Plan::tasks`]; `None` when no
    /// candidate artifact survived and the placeholder was promoted.
    pub winner: Option<usize>,
    pub candidate_index: Option<usize>,
    pub score: Option<i64>,
    pub final_paths: Vec<PathBuf>,
    pub placeholder: bool,
    pub retained: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

/// Promotes one winner per entity to its final paths, keeps up to `keep`
/// runner-ups in scratch and deletes the remaining candidates.
pub fn select_winners(
    plan: &Plan,
    scores: &[ScoreRecord],
    keep: usize,
    tie_breaker: &mut dyn TieBreaker,
    reporter: &Reporter,
) -> Vec<Selection> {
    let by_task: HashMap<usize, Score> = scores
        .iter()
        .map(|record| (record.task, record.score))
        .collect();
    // Keyed by primary final path too, so equal ids in two families stay apart.
    let mut entities: IndexMap<(&str, Option<&PathBuf>), Vec<usize>> = IndexMap::new();
    for (idx, task) in plan.tasks.iter().enumerate() {
        entities
            .entry((task.entity_id.as_str(), task.final_paths.first()))
            .or_default()
            .push(idx);
    }

    let mut scratch_dirs = BTreeSet::new();
    let mut selections = Vec::with_capacity(entities.len());
    for ((entity_id, _), members) in entities {
        let candidates: Vec<Candidate<'_>> = members
            .into_iter()
            .map(|idx| Candidate {
                idx,
                task: &plan.tasks[idx],
                score: by_task.get(&idx).copied().unwrap_or(Score::Unscored),
            })
            .collect();
        for candidate in &candidates {
            if let Some(dir) = candidate.task.scratch_path.parent() {
                scratch_dirs.insert(dir.to_path_buf());
            }
        }
        let selection = select_entity(entity_id, &candidates, keep, tie_breaker, reporter);
        reporter.event(
            "entity_selected",
            json!({
                "entity_id": selection.entity_id,
                "index": selection.candidate_index,
                "score": selection.score,
                "placeholder": selection.placeholder,
                "final_paths": selection
                    .final_paths
                    .iter()
                    .map(|path| path.to_string_lossy())
                    .collect::<Vec<_>>(),
                "retained": selection.retained.len(),
            }),
        );
        selections.push(selection);
    }

    for dir in scratch_dirs {
        remove_if_empty(&dir);
    }
    selections
}

struct Candidate<'a> {
    idx: usize,
    task: &'a CandidateTask,
    score: Score,
}

fn select_entity(
    entity_id: &str,
    candidates: &[Candidate<'_>],
    keep: usize,
    tie_breaker: &mut dyn TieBreaker,
    reporter: &Reporter,
) -> Selection {
    let final_paths = candidates
        .first()
        .map(|candidate| candidate.task.final_paths.clone())
        .unwrap_or_default();
    let mut selection = Selection {
        entity_id: entity_id.to_string(),
        winner: None,
        candidate_index: None,
        score: None,
        final_paths,
        placeholder: true,
        retained: Vec::new(),
        deleted: Vec::new(),
    };

    let present: Vec<&Candidate<'_>> = candidates
        .iter()
        .filter(|candidate| artifact_exists(&candidate.task.scratch_path))
        .collect();
    let best = present.iter().filter_map(|c| c.score.value()).max();
    // Without any judged candidate every artifact ties.
    let tied: Vec<&Candidate<'_>> = present
        .iter()
        .copied()
        .filter(|c| best.is_none() || c.score.value() == best)
        .collect();

    let winner = if tied.is_empty() {
        None
    } else {
        tied.get(tie_breaker.pick(tied.len()).min(tied.len() - 1))
            .copied()
    };

    match winner {
        Some(winner) => match promote(&winner.task.scratch_path, &selection.final_paths) {
            Ok(placeholder) => {
                selection.winner = Some(winner.idx);
                selection.candidate_index = Some(winner.task.index);
                selection.score = winner.score.value();
                selection.placeholder = placeholder;
                info!(
                    entity_id,
                    index = winner.task.index,
                    score = ?selection.score,
                    tied = tied.len(),
                    "winner selected"
                );
            }
            Err(err) => {
                reporter.failure(
                    Stage::Selection,
                    entity_id,
                    format!("promoting candidate {} failed: {err:#}", winner.task.index),
                );
                promote_placeholder(&selection.final_paths, entity_id, reporter);
            }
        },
        None => {
            reporter.failure(
                Stage::Selection,
                entity_id,
                "no candidate artifact; placeholder promoted",
            );
            promote_placeholder(&selection.final_paths, entity_id, reporter);
        }
    }

    let mut runner_ups: Vec<&Candidate<'_>> = present
        .iter()
        .copied()
        .filter(|c| Some(c.idx) != selection.winner && c.score.is_judged())
        .collect();
    runner_ups.sort_by(|a, b| {
        b.score
            .value()
            .cmp(&a.score.value())
            .then(a.task.index.cmp(&b.task.index))
    });
    let retained: BTreeSet<usize> = runner_ups.iter().take(keep).map(|c| c.idx).collect();

    for candidate in &present {
        let path = &candidate.task.scratch_path;
        if retained.contains(&candidate.idx) {
            selection.retained.push(path.clone());
            continue;
        }
        match std::fs::remove_file(path) {
            Ok(()) => selection.deleted.push(path.clone()),
            Err(err) => reporter.warning(format!(
                "{entity_id}: could not delete {}: {err}",
                path.display()
            )),
        }
    }
    selection
}

/// Copies the winner to every final path. Returns whether it was the
/// placeholder.
fn promote(scratch: &Path, final_paths: &[PathBuf]) -> Result<bool> {
    let bytes = std::fs::read(scratch)
        .with_context(|| format!("failed reading candidate {}", scratch.display()))?;
    for path in final_paths {
        write_artifact(path, &bytes)?;
    }
    Ok(is_placeholder(&bytes))
}

fn promote_placeholder(final_paths: &[PathBuf], entity_id: &str, reporter: &Reporter) {
    for path in final_paths {
        if let Err(err) = write_placeholder(path) {
            reporter.failure(Stage::Selection, entity_id, format!("{err:#}"));
        }
    }
}

fn remove_if_empty(dir: &Path) {
    let empty = std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        match std::fs::remove_dir(dir) {
            Ok(()) => debug!(dir = %dir.display(), "removed empty scratch dir"),
            Err(err) => debug!(dir = %dir.display(), error = %err, "scratch dir kept"),
        }
    }
}
