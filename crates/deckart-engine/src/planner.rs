use std::collections::HashSet;
use std::path::{Path, PathBuf};

use deckart_contracts::config::{ApiMode, PipelineConfig};
use deckart_contracts::entities::Entity;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::placeholder::{artifact_exists, PLACEHOLDER_PNG};
use crate::provider::{AssetProvider, GenerateRequest, ModeCapabilities};

pub const CANDIDATES_DIR: &str = "candidates";
pub const REFERENCE_SUFFIX: &str = "_reference";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyLayout {
    pub dir: PathBuf,
    pub extension: String,
}

impl FamilyLayout {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn candidates_dir(&self) -> PathBuf {
        self.dir.join(CANDIDATES_DIR)
    }

    pub fn final_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{}", self.extension))
    }

    pub fn reference_path(&self, id: &str) -> PathBuf {
        self.final_path(&format!("{id}{REFERENCE_SUFFIX}"))
    }

    pub fn scratch_path(&self, stem: &str, index: usize) -> PathBuf {
        self.candidates_dir()
            .join(format!("{stem}_c{index:02}.{}", self.extension))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRole {
    Card,
    Reference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub mode: ApiMode,
    pub model: String,
    pub size: String,
    pub quality: Option<String>,
    pub background: Option<String>,
    pub output_format: String,
}

impl GenerationParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            mode: config.api_mode,
            model: config.model.clone(),
            size: config.size.clone(),
            quality: config.quality.clone(),
            background: config.background.clone(),
            output_format: config.output_format.clone(),
        }
    }
}

/// How a task ended up with (or without) its scratch artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A non-empty candidate from an earlier run was reused.
    Reused,
    Generated,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateTask {
    pub entity_id: String,
    pub title: String,
    pub prompt: String,
    /// 1-based, unique per entity.
    pub index: usize,
    pub scratch_path: PathBuf,
    /// Primary final path first, then aliases.
    pub final_paths: Vec<PathBuf>,
    pub references: Vec<PathBuf>,
    pub params: GenerationParams,
    pub resume: bool,
    pub role: TaskRole,
    pub resolution: Option<Resolution>,
}

impl CandidateTask {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Whether this candidate is worth sending to the judge.
    pub fn is_scorable(&self) -> bool {
        matches!(
            self.resolution,
            Some(Resolution::Generated) | Some(Resolution::Reused)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub entity_id: String,
    pub mode: ApiMode,
    pub model: String,
    pub size: String,
    pub quality: Option<String>,
    pub background: Option<String>,
    pub references: String,
}

impl BatchKey {
    fn for_task(task: &CandidateTask) -> Self {
        Self {
            entity_id: task.entity_id.clone(),
            mode: task.params.mode,
            model: task.params.model.clone(),
            size: task.params.size.clone(),
            quality: task.params.quality.clone(),
            background: task.params.background.clone(),
            references: reference_set_id(&task.references),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationBatch {
    pub key: BatchKey,
    pub tasks: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub tasks: Vec<CandidateTask>,
    pub batches: Vec<GenerationBatch>,
    /// Entities left alone because every final path already exists.
    pub skipped_entities: Vec<String>,
    /// Later records whose id, scratch names or final paths were already
    /// claimed by an earlier entity of the same family.
    pub duplicate_entities: Vec<String>,
}

impl Plan {
    pub fn pending_count(&self) -> usize {
        self.batches.iter().map(|batch| batch.tasks.len()).sum()
    }

    pub fn reused_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.resolution == Some(Resolution::Reused))
            .count()
    }

    pub fn merge(&mut self, other: Plan) {
        let offset = self.tasks.len();
        self.tasks.extend(other.tasks);
        for mut batch in other.batches {
            for idx in &mut batch.tasks {
                *idx += offset;
            }
            self.batches.push(batch);
        }
        self.skipped_entities.extend(other.skipped_entities);
        self.duplicate_entities.extend(other.duplicate_entities);
    }

    pub fn request_for(&self, batch: &GenerationBatch) -> Option<GenerateRequest> {
        let first = self.tasks.get(*batch.tasks.first()?)?;
        Some(GenerateRequest {
            prompt: first.prompt.clone(),
            mode: first.params.mode,
            model: first.params.model.clone(),
            size: first.params.size.clone(),
            quality: first.params.quality.clone(),
            background: first.params.background.clone(),
            output_format: first.params.output_format.clone(),
            n: batch.tasks.len(),
            references: first.references.clone(),
        })
    }
}

pub struct PlanRequest<'a> {
    pub layout: &'a FamilyLayout,
    pub entities: &'a [Entity],
    pub candidates: i64,
    pub references: &'a [PathBuf],
    pub params: GenerationParams,
    pub batch_size: usize,
    pub resume: bool,
    pub role: TaskRole,
}

/// Expands entities into candidate tasks and groups the ones still needing
/// generation into batches.
pub fn plan(request: PlanRequest<'_>, provider: &dyn AssetProvider) -> Plan {
    let mut out = Plan::default();
    let Ok(count) = usize::try_from(request.candidates) else {
        return out;
    };
    if count == 0 {
        return out;
    }

    let mode = effective_mode(request.params.mode, !request.references.is_empty());
    let caps = provider.capabilities(mode, &request.params.model);
    let references = effective_references(request.references, mode, caps);
    let params = GenerationParams {
        mode,
        ..request.params.clone()
    };

    let mut claimed_stems: HashSet<String> = HashSet::new();
    let mut claimed_finals: HashSet<PathBuf> = HashSet::new();
    for entity in request.entities {
        let (stem, final_paths) = match request.role {
            TaskRole::Card => (
                entity.scratch_stem(),
                entity
                    .final_ids()
                    .iter()
                    .map(|id| request.layout.final_path(id))
                    .collect::<Vec<PathBuf>>(),
            ),
            TaskRole::Reference => (
                format!("{}{REFERENCE_SUFFIX}", entity.id),
                vec![request.layout.reference_path(&entity.id)],
            ),
        };

        if claimed_stems.contains(&stem)
            || final_paths.iter().any(|path| claimed_finals.contains(path))
        {
            out.duplicate_entities.push(entity.id.clone());
            continue;
        }
        claimed_stems.insert(stem.clone());
        claimed_finals.extend(final_paths.iter().cloned());

        if request.resume && final_paths.iter().all(|path| artifact_exists(path)) {
            out.skipped_entities.push(entity.id.clone());
            continue;
        }

        for index in 1..=count {
            let scratch_path = request.layout.scratch_path(&stem, index);
            let resolution = (request.resume && is_reusable(&scratch_path))
                .then_some(Resolution::Reused);
            out.tasks.push(CandidateTask {
                entity_id: entity.id.clone(),
                title: entity.title.clone(),
                prompt: entity.prompt.clone(),
                index,
                scratch_path,
                final_paths: final_paths.clone(),
                references: references.clone(),
                params: params.clone(),
                resume: request.resume,
                role: request.role,
                resolution,
            });
        }
    }

    out.batches = partition(&out.tasks, batch_ceiling(request.batch_size, caps));
    out
}

pub fn partition(tasks: &[CandidateTask], ceiling: usize) -> Vec<GenerationBatch> {
    let ceiling = ceiling.max(1);
    let mut grouped: IndexMap<BatchKey, Vec<usize>> = IndexMap::new();
    for (idx, task) in tasks.iter().enumerate() {
        if task.is_resolved() {
            continue;
        }
        grouped.entry(BatchKey::for_task(task)).or_default().push(idx);
    }

    let mut batches = Vec::new();
    for (key, indices) in grouped {
        for chunk in indices.chunks(ceiling) {
            batches.push(GenerationBatch {
                key: key.clone(),
                tasks: chunk.to_vec(),
            });
        }
    }
    batches
}

pub fn batch_ceiling(batch_size: usize, caps: ModeCapabilities) -> usize {
    if !caps.supports_multi_output() {
        return 1;
    }
    batch_size.max(1).min(caps.max_outputs)
}

/// References turn plain generation into an edit; edits without references
/// fall back to plain generation.
fn effective_mode(configured: ApiMode, has_references: bool) -> ApiMode {
    match (configured, has_references) {
        (ApiMode::Images, true) => ApiMode::Edits,
        (ApiMode::Edits, false) => ApiMode::Images,
        (mode, _) => mode,
    }
}

fn effective_references(
    references: &[PathBuf],
    mode: ApiMode,
    caps: ModeCapabilities,
) -> Vec<PathBuf> {
    if !mode.is_conditioned() {
        return Vec::new();
    }
    if caps.multi_reference {
        references.to_vec()
    } else {
        references.iter().take(1).cloned().collect()
    }
}

fn reference_set_id(references: &[PathBuf]) -> String {
    if references.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    for path in references {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..6])
}

fn is_reusable(path: &Path) -> bool {
    if !artifact_exists(path) {
        return false;
    }
    let len = std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    if len != PLACEHOLDER_PNG.len() as u64 {
        return true;
    }
    std::fs::read(path)
        .map(|bytes| bytes != PLACEHOLDER_PNG)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::placeholder::write_placeholder;
    use crate::provider::CritiqueRequest;

    struct CapsOnly {
        caps: ModeCapabilities,
    }

    #[async_trait]
    impl AssetProvider for CapsOnly {
        fn name(&self) -> &str {
            "caps-only"
        }

        fn capabilities(&self, _mode: ApiMode, _model: &str) -> ModeCapabilities {
            self.caps
        }

        async fn generate(&self, _request: &GenerateRequest) -> Result<Vec<Vec<u8>>> {
            anyhow::bail!("not used")
        }

        async fn critique(&self, _request: &CritiqueRequest) -> Result<Value> {
            anyhow::bail!("not used")
        }
    }

    fn multi(max_outputs: usize) -> CapsOnly {
        CapsOnly {
            caps: ModeCapabilities {
                max_outputs,
                multi_reference: false,
            },
        }
    }

    fn params() -> GenerationParams {
        GenerationParams::from_config(&PipelineConfig::default())
    }

    fn entities() -> Vec<Entity> {
        let mut power = Entity::new("b", "B", "prompt b");
        power.power = true;
        vec![Entity::new("a", "A", "prompt a"), power]
    }

    fn request<'a>(
        layout: &'a FamilyLayout,
        entities: &'a [Entity],
        references: &'a [PathBuf],
        candidates: i64,
    ) -> PlanRequest<'a> {
        PlanRequest {
            layout,
            entities,
            candidates,
            references,
            params: params(),
            batch_size: 3,
            resume: true,
            role: TaskRole::Card,
        }
    }

    #[test]
    fn expands_one_task_per_entity_and_index() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let entities = entities();
        let plan = plan(request(&layout, &entities, &[], 4), &multi(8));

        assert_eq!(plan.tasks.len(), 8);
        assert_eq!(plan.tasks[0].index, 1);
        assert_eq!(
            plan.tasks[5].scratch_path,
            temp.path().join("candidates").join("b_power_c02.png")
        );
        assert_eq!(
            plan.tasks[5].final_paths,
            vec![temp.path().join("b.png"), temp.path().join("b_power.png")]
        );
        // 4 tasks per entity with a ceiling of 3 -> 3 + 1 per entity.
        let sizes: Vec<usize> = plan.batches.iter().map(|b| b.tasks.len()).collect();
        assert_eq!(sizes, vec![3, 1, 3, 1]);
        assert!(plan
            .batches
            .iter()
            .all(|b| b.tasks.iter().all(|i| plan.tasks[*i].entity_id == b.key.entity_id)));
        Ok(())
    }

    #[test]
    fn repeated_ids_keep_the_first_record_only() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let mut alias = Entity::new("c", "C", "prompt c");
        alias.aliases = vec!["a".to_string()];
        let entities = vec![
            Entity::new("dup", "First", "pa"),
            Entity::new("dup", "Second", "pb"),
            alias,
        ];
        let plan = plan(request(&layout, &entities, &[], 3), &multi(4));

        assert_eq!(plan.duplicate_entities, vec!["dup"]);
        assert_eq!(plan.tasks.len(), 6);
        assert!(plan
            .tasks
            .iter()
            .filter(|t| t.entity_id == "dup")
            .all(|t| t.prompt == "pa"));

        let scratch: HashSet<&PathBuf> = plan.tasks.iter().map(|t| &t.scratch_path).collect();
        assert_eq!(scratch.len(), plan.tasks.len());
        for batch in &plan.batches {
            let paths: HashSet<&PathBuf> =
                batch.tasks.iter().map(|i| &plan.tasks[*i].scratch_path).collect();
            assert_eq!(paths.len(), batch.tasks.len());
        }
        Ok(())
    }

    #[test]
    fn alias_colliding_with_an_earlier_final_path_is_dropped() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let mut alias = Entity::new("c", "C", "prompt c");
        alias.aliases = vec!["a".to_string()];
        let entities = vec![Entity::new("a", "A", "prompt a"), alias];
        let plan = plan(request(&layout, &entities, &[], 2), &multi(4));

        assert_eq!(plan.duplicate_entities, vec!["c"]);
        assert!(plan.tasks.iter().all(|t| t.entity_id == "a"));
        Ok(())
    }

    #[test]
    fn non_positive_candidate_count_plans_nothing() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let entities = entities();
        assert_eq!(plan(request(&layout, &entities, &[], 0), &multi(4)), Plan::default());
        assert_eq!(plan(request(&layout, &entities, &[], -2), &multi(4)), Plan::default());
        Ok(())
    }

    #[test]
    fn single_output_modes_force_batches_of_one() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let entities = entities();
        let plan = plan(request(&layout, &entities, &[], 3), &multi(1));
        assert_eq!(plan.batches.len(), 6);
        assert!(plan.batches.iter().all(|b| b.tasks.len() == 1));
        Ok(())
    }

    #[test]
    fn references_upgrade_to_edits_and_trim_to_first_without_multi_reference() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let entities = entities();
        let references = vec![PathBuf::from("r1.png"), PathBuf::from("r2.png")];
        let plan = plan(request(&layout, &entities, &references, 1), &multi(4));

        let task = &plan.tasks[0];
        assert_eq!(task.params.mode, ApiMode::Edits);
        assert_eq!(task.references, vec![PathBuf::from("r1.png")]);
        assert!(!plan.batches[0].key.references.is_empty());

        let request = plan.request_for(&plan.batches[0]);
        assert_eq!(request.map(|r| r.n), Some(1));
        Ok(())
    }

    #[test]
    fn resume_skips_finished_entities_and_reuses_candidates() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let entities = entities();
        std::fs::write(layout.final_path("a"), b"done")?;
        std::fs::create_dir_all(layout.candidates_dir())?;
        std::fs::write(layout.scratch_path("b_power", 1), b"earlier")?;
        write_placeholder(&layout.scratch_path("b_power", 2))?;
        // Only one of b's two final paths exists, so b is still planned.
        std::fs::write(layout.final_path("b"), b"partial")?;

        let plan = plan(request(&layout, &entities, &[], 3), &multi(4));
        assert_eq!(plan.skipped_entities, vec!["a"]);
        assert_eq!(plan.tasks.len(), 3);
        assert_eq!(plan.tasks[0].resolution, Some(Resolution::Reused));
        assert_eq!(plan.tasks[1].resolution, None);
        assert_eq!(plan.reused_count(), 1);
        assert_eq!(plan.pending_count(), 2);
        Ok(())
    }

    #[test]
    fn merge_rebases_batch_indices() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let first = FamilyLayout::new(temp.path().join("policies"), "png");
        let second = FamilyLayout::new(temp.path().join("developments"), "png");
        let entities = entities();

        let mut merged = plan(request(&first, &entities[..1], &[], 2), &multi(4));
        merged.merge(plan(request(&second, &entities[1..], &[], 2), &multi(4)));

        assert_eq!(merged.tasks.len(), 4);
        assert_eq!(merged.batches.len(), 2);
        assert_eq!(merged.batches[1].tasks, vec![2, 3]);
        assert!(merged.batches[1]
            .tasks
            .iter()
            .all(|idx| merged.tasks[*idx].entity_id == "b"));
        Ok(())
    }

    #[test]
    fn reference_role_targets_reference_paths() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let entities = entities();
        let mut req = request(&layout, &entities[..1], &[], 2);
        req.role = TaskRole::Reference;
        let plan = plan(req, &multi(4));

        assert_eq!(plan.tasks[0].final_paths, vec![temp.path().join("a_reference.png")]);
        assert_eq!(
            plan.tasks[1].scratch_path,
            temp.path().join("candidates").join("a_reference_c02.png")
        );
        Ok(())
    }
}
