use anyhow::{bail, Context, Result};
use deckart_contracts::config::StageLimits;
use serde_json::json;
use tracing::info;

use crate::placeholder::{write_artifact, write_placeholder};
use crate::planner::{Plan, Resolution};
use crate::provider::{AssetProvider, GenerateRequest};
use crate::report::{Reporter, Stage};
use crate::scheduler::BoundedRunner;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub batches: usize,
    pub generated: usize,
    pub placeholders: usize,
    pub failed_batches: usize,
}

/// Executes every batch of `plan` and marks each task with how its scratch
/// artifact was produced. Failures are reported, never returned: every task
/// ends up with some artifact, the placeholder at worst.
pub async fn run_generation(
    plan: &mut Plan,
    provider: &dyn AssetProvider,
    limits: &StageLimits,
    reporter: &Reporter,
) -> GenerationOutcome {
    let mut outcome = GenerationOutcome {
        batches: plan.batches.len(),
        ..GenerationOutcome::default()
    };
    if plan.batches.is_empty() {
        return outcome;
    }

    let requests: Vec<Option<GenerateRequest>> = plan
        .batches
        .iter()
        .map(|batch| plan.request_for(batch))
        .collect();
    info!(
        batches = plan.batches.len(),
        tasks = plan.pending_count(),
        provider = provider.name(),
        "generating candidates"
    );

    let runner = BoundedRunner::new("generation", limits);
    let shared: &Plan = plan;
    let results = runner
        .run(shared.batches.len(), |idx, attempt| {
            let batch = &shared.batches[idx];
            let request = requests[idx].as_ref();
            async move {
                let Some(request) = request else {
                    bail!("batch has no tasks");
                };
                let entity_id = batch.key.entity_id.as_str();
                let images = generate_with_fallback(provider, request, entity_id, reporter)
                    .await
                    .with_context(|| format!("{entity_id} attempt {attempt}"))?;
                let mut resolutions = Vec::with_capacity(batch.tasks.len());
                let mut images = images.into_iter();
                for task_idx in &batch.tasks {
                    let path = &shared.tasks[*task_idx].scratch_path;
                    match images.next() {
                        Some(bytes) => {
                            write_artifact(path, &bytes)?;
                            resolutions.push(Resolution::Generated);
                        }
                        None => {
                            write_placeholder(path)?;
                            resolutions.push(Resolution::Placeholder);
                        }
                    }
                }
                Ok(resolutions)
            }
        })
        .await;

    let mut marks: Vec<(usize, Resolution)> = Vec::new();
    for (batch, result) in plan.batches.iter().zip(results) {
        match result {
            Ok(resolutions) => {
                let short = resolutions
                    .iter()
                    .filter(|res| **res == Resolution::Placeholder)
                    .count();
                if short > 0 {
                    reporter.warning(format!(
                        "{}: provider returned {} of {} images; {short} placeholder(s) written",
                        batch.key.entity_id,
                        batch.tasks.len() - short,
                        batch.tasks.len()
                    ));
                }
                marks.extend(batch.tasks.iter().copied().zip(resolutions));
            }
            Err(failure) => {
                outcome.failed_batches += 1;
                reporter.failure(
                    Stage::Generation,
                    &batch.key.entity_id,
                    format!(
                        "{} candidate(s) replaced by placeholder: {failure}",
                        batch.tasks.len()
                    ),
                );
                for task_idx in &batch.tasks {
                    let path = &plan.tasks[*task_idx].scratch_path;
                    if let Err(err) = write_placeholder(path) {
                        reporter.failure(
                            Stage::Generation,
                            &batch.key.entity_id,
                            format!("{err:#}"),
                        );
                        continue;
                    }
                    marks.push((*task_idx, Resolution::Placeholder));
                }
            }
        }
    }

    for (task_idx, resolution) in marks {
        match resolution {
            Resolution::Generated => outcome.generated += 1,
            Resolution::Placeholder => outcome.placeholders += 1,
            Resolution::Reused => {}
        }
        let task = &mut plan.tasks[task_idx];
        task.resolution = Some(resolution);
        reporter.event(
            "candidate_written",
            json!({
                "entity_id": task.entity_id,
                "index": task.index,
                "path": task.scratch_path.to_string_lossy(),
                "placeholder": resolution == Resolution::Placeholder,
            }),
        );
    }
    outcome
}

/// Calls the provider; a conditioned request that fails is retried once
/// without its references inside the same attempt.
async fn generate_with_fallback(
    provider: &dyn AssetProvider,
    request: &GenerateRequest,
    entity_id: &str,
    reporter: &Reporter,
) -> Result<Vec<Vec<u8>>> {
    let first = provider.generate(request).await;
    let images = match first {
        Ok(images) => images,
        Err(err) if request.mode.is_conditioned() && !request.references.is_empty() => {
            reporter.warning(format!(
                "{entity_id}: {} call failed ({err:#}); falling back to unconditioned generation",
                request.mode.as_str()
            ));
            provider
                .generate(&request.unconditioned())
                .await
                .context("unconditioned fallback failed")?
        }
        Err(err) => return Err(err),
    };

    let usable: Vec<Vec<u8>> = images
        .into_iter()
        .filter(|bytes| !bytes.is_empty())
        .take(request.n.max(1))
        .collect();
    if usable.is_empty() {
        bail!("provider returned no usable images");
    }
    Ok(usable)
}
