use anyhow::{anyhow, Context, Result};
use deckart_contracts::config::StageLimits;
use serde_json::{json, Value};
use tracing::info;

use crate::planner::{CandidateTask, Plan, TaskRole};
use crate::provider::{critique_instructions, rating_schema, AssetProvider, CritiqueRequest};
use crate::report::{Reporter, Stage};
use crate::scheduler::{BoundedRunner, Permanent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Rated(i64),
    /// Critique failed for good; ranks as 0.
    Failed,
    /// Never sent to the judge (placeholder art).
    Unscored,
}

impl Score {
    /// Ranking value; `None` sorts below every judged candidate.
    pub fn value(&self) -> Option<i64> {
        match self {
            Score::Rated(rating) => Some(*rating),
            Score::Failed => Some(0),
            Score::Unscored => None,
        }
    }

    pub fn is_judged(&self) -> bool {
        !matches!(self, Score::Unscored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreRecord {
    pub task: usize,
    pub score: Score,
}

pub struct CritiqueSettings<'a> {
    pub model: &'a str,
    pub limits: &'a StageLimits,
}

/// Scores every generated or reused candidate of `plan`. Returns one record
/// per task, in task order.
pub async fn score_candidates(
    plan: &Plan,
    provider: &dyn AssetProvider,
    settings: &CritiqueSettings<'_>,
    reporter: &Reporter,
) -> Vec<ScoreRecord> {
    let mut records: Vec<ScoreRecord> = (0..plan.tasks.len())
        .map(|task| ScoreRecord {
            task,
            score: Score::Unscored,
        })
        .collect();
    let scorable: Vec<usize> = plan
        .tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| task.is_scorable())
        .map(|(idx, _)| idx)
        .collect();
    if scorable.is_empty() {
        return records;
    }
    info!(
        candidates = scorable.len(),
        model = settings.model,
        "scoring candidates"
    );

    let schema = rating_schema();
    let runner = BoundedRunner::new("critique", settings.limits);
    let results = runner
        .run(scorable.len(), |idx, _attempt| {
            let task = &plan.tasks[scorable[idx]];
            let schema = &schema;
            async move {
                let request = build_request(task, settings.model, schema)?;
                let judgment = provider.critique(&request).await?;
                parse_rating(&judgment)
            }
        })
        .await;

    for (task_idx, result) in scorable.into_iter().zip(results) {
        let task = &plan.tasks[task_idx];
        let score = match result {
            Ok(rating) => Score::Rated(rating),
            Err(failure) => {
                reporter.failure(
                    Stage::Critique,
                    &task.entity_id,
                    format!("candidate {} scored 0: {failure}", task.index),
                );
                Score::Failed
            }
        };
        reporter.event(
            "candidate_scored",
            json!({
                "entity_id": task.entity_id,
                "index": task.index,
                "score": score.value(),
            }),
        );
        records[task_idx].score = score;
    }
    records
}

fn build_request(task: &CandidateTask, model: &str, schema: &Value) -> Result<CritiqueRequest> {
    let candidate = std::fs::read(&task.scratch_path)
        .map_err(|err| {
            anyhow::Error::new(Permanent(format!(
                "missing candidate {}: {err}",
                task.scratch_path.display()
            )))
        })?;
    if candidate.is_empty() {
        return Err(Permanent(format!("empty candidate {}", task.scratch_path.display())).into());
    }

    // Bootstrap candidates are judged on their own; there is no reference yet.
    let reference = match (task.role, task.references.first()) {
        (TaskRole::Card, Some(path)) => Some(
            std::fs::read(path)
                .with_context(|| format!("failed reading reference {}", path.display()))?,
        ),
        _ => None,
    };

    Ok(CritiqueRequest {
        model: model.to_string(),
        instructions: critique_instructions(&task.title, &task.prompt, reference.is_some()),
        candidate,
        reference,
        schema: schema.clone(),
    })
}

/// Accepts an integer `rating`, a float (rounded) or a numeric string. The
/// value is kept as the judge returned it.
pub fn parse_rating(judgment: &Value) -> Result<i64> {
    let raw = judgment
        .get("rating")
        .ok_or_else(|| anyhow!("critique response has no `rating`: {judgment}"))?;
    let rating = match raw {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value.round() as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| anyhow!("critique `rating` is not an integer: {raw}"))?;
    Ok(rating)
}
