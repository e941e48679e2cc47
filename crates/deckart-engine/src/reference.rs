//! Reference Resolver: user supplied reference images, or a bootstrap cycle
//! that generates one per family.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use deckart_contracts::config::PipelineConfig;
use deckart_contracts::entities::EntityFamily;
use tracing::{debug, info};

use crate::placeholder::{artifact_exists, is_placeholder};
use crate::planner::{plan, FamilyLayout, GenerationParams, Plan, PlanRequest, TaskRole};
use crate::provider::AssetProvider;
use crate::report::{Reporter, Stage};
use crate::selection::Selection;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSource {
    User,
    /// Bootstrapped by an earlier run and reused.
    Existing,
    Bootstrapped,
    /// Generation for this family runs unconditioned.
    Unconditioned,
}

impl ReferenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceSource::User => "user",
            ReferenceSource::Existing => "existing",
            ReferenceSource::Bootstrapped => "bootstrapped",
            ReferenceSource::Unconditioned => "unconditioned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyReferences {
    pub family: String,
    pub paths: Vec<PathBuf>,
    pub source: ReferenceSource,
}

impl FamilyReferences {
    pub fn unconditioned(family: &str) -> Self {
        Self {
            family: family.to_string(),
            paths: Vec::new(),
            source: ReferenceSource::Unconditioned,
        }
    }
}

/// Resolves a user reference spec: a file, a directory (supported images,
/// sorted by name), or a comma separated list of files, directories and glob
/// patterns. Missing entries are skipped; results are deduplicated by
/// absolute path.
pub fn resolve_user_references(spec: &str) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        for path in expand_entry(entry)? {
            let key = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            if seen.insert(key) {
                out.push(path);
            }
        }
    }
    Ok(out)
}

fn expand_entry(entry: &str) -> Result<Vec<PathBuf>> {
    if entry.contains(['*', '?', '[']) {
        let mut matches: Vec<PathBuf> = glob::glob(entry)
            .with_context(|| format!("invalid reference glob '{entry}'"))?
            .filter_map(|hit| hit.ok())
            .filter(|path| path.is_file() && has_supported_extension(path))
            .collect();
        matches.sort();
        return Ok(matches);
    }

    let path = PathBuf::from(entry);
    if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&path)
            .with_context(|| format!("failed listing {}", path.display()))?
            .filter_map(|item| item.ok().map(|item| item.path()))
            .filter(|path| path.is_file() && has_supported_extension(path))
            .collect();
        files.sort();
        return Ok(files);
    }
    if path.is_file() {
        return Ok(vec![path]);
    }
    debug!(entry, "reference entry not found");
    Ok(Vec::new())
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug)]
pub enum Bootstrap {
    /// A usable reference from an earlier run.
    Existing(PathBuf),
    /// Candidates to run through generate, critique and select.
    Planned(Plan),
    Disabled,
}

/// Plans the bootstrap cycle for `family`: `candidates * reference_multiplier`
/// unconditioned candidates of its first entity, with the reference prompt
/// suffix appended.
pub fn plan_bootstrap(
    family: &EntityFamily,
    layout: &FamilyLayout,
    config: &PipelineConfig,
    provider: &dyn AssetProvider,
) -> Bootstrap {
    let Some(representative) = family.entities.first() else {
        return Bootstrap::Disabled;
    };
    let path = layout.reference_path(&representative.id);
    if config.resume && is_usable_reference(&path) {
        return Bootstrap::Existing(path);
    }
    if !config.bootstrap_references {
        return Bootstrap::Disabled;
    }

    let mut entity = representative.clone();
    let suffix = config.reference_prompt_suffix.trim();
    if !suffix.is_empty() {
        entity.prompt = format!("{} {suffix}", entity.prompt.trim());
    }
    let planned = plan(
        PlanRequest {
            layout,
            entities: std::slice::from_ref(&entity),
            candidates: config.reference_candidates(),
            references: &[],
            params: GenerationParams::from_config(config),
            batch_size: config.batch_size,
            // A placeholder reference was rejected above; start fresh.
            resume: false,
            role: TaskRole::Reference,
        },
        provider,
    );
    if planned.tasks.is_empty() {
        return Bootstrap::Disabled;
    }
    info!(
        family = %family.name,
        entity_id = %entity.id,
        candidates = planned.tasks.len(),
        "bootstrapping reference"
    );
    Bootstrap::Planned(planned)
}

/// Checks the bootstrap winner. A placeholder is no reference: it is
/// removed and the family continues unconditioned.
pub fn accept_bootstrap(
    family: &str,
    selection: Option<&Selection>,
    reporter: &Reporter,
) -> Option<PathBuf> {
    let Some(selection) = selection else {
        reporter.failure(Stage::Reference, family, "bootstrap produced no selection");
        return None;
    };
    let path = selection.final_paths.first()?.clone();
    if selection.placeholder || !is_usable_reference(&path) {
        for stale in &selection.final_paths {
            if let Err(err) = std::fs::remove_file(stale) {
                debug!(path = %stale.display(), error = %err, "placeholder reference not removed");
            }
        }
        reporter.failure(
            Stage::Reference,
            &selection.entity_id,
            format!("reference bootstrap for family '{family}' failed; generating unconditioned"),
        );
        return None;
    }
    Some(path)
}

fn is_usable_reference(path: &Path) -> bool {
    artifact_exists(path)
        && std::fs::read(path)
            .map(|bytes| !is_placeholder(&bytes))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use deckart_contracts::entities::Entity;

    use super::*;
    use crate::placeholder::write_placeholder;
    use crate::provider::DryrunProvider;

    fn family() -> EntityFamily {
        EntityFamily::new(
            "policies",
            vec![
                Entity::new("pol_001", "Carbon Tax", "smokestacks"),
                Entity::new("pol_002", "Subsidy", "coins"),
            ],
        )
    }

    fn selection(path: PathBuf, placeholder: bool) -> Selection {
        Selection {
            entity_id: "pol_001".to_string(),
            winner: Some(0),
            candidate_index: Some(1),
            score: Some(6),
            final_paths: vec![path],
            placeholder,
            retained: Vec::new(),
            deleted: Vec::new(),
        }
    }

    #[test]
    fn directories_list_supported_images_in_name_order() -> Result<()> {
        let temp = tempfile::tempdir()?;
        for name in ["b.png", "a.JPG", "notes.txt", "c.webp"] {
            std::fs::write(temp.path().join(name), b"x")?;
        }
        std::fs::create_dir(temp.path().join("nested.png"))?;

        let resolved = resolve_user_references(&temp.path().to_string_lossy())?;
        let names: Vec<String> = resolved
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.png", "c.webp"]);
        Ok(())
    }

    #[test]
    fn comma_lists_mix_files_and_globs_without_duplicates() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let first = temp.path().join("ref1.png");
        let second = temp.path().join("ref2.png");
        std::fs::write(&first, b"1")?;
        std::fs::write(&second, b"2")?;

        let spec = format!(
            "{}, {}/ref*.png, {}/missing.png",
            first.display(),
            temp.path().display(),
            temp.path().display()
        );
        let resolved = resolve_user_references(&spec)?;
        assert_eq!(resolved, vec![first, second]);
        Ok(())
    }

    #[test]
    fn unresolvable_specs_yield_nothing() -> Result<()> {
        assert!(resolve_user_references("")?.is_empty());
        assert!(resolve_user_references("/definitely/not/here.png")?.is_empty());
        Ok(())
    }

    #[test]
    fn bootstrap_plans_multiplied_reference_candidates() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let config = PipelineConfig {
            candidates: 2,
            reference_multiplier: 3,
            ..PipelineConfig::default()
        };

        let Bootstrap::Planned(planned) =
            plan_bootstrap(&family(), &layout, &config, &DryrunProvider)
        else {
            panic!("expected a bootstrap plan");
        };
        assert_eq!(planned.tasks.len(), 6);
        assert!(planned.tasks.iter().all(|t| t.role == TaskRole::Reference));
        assert!(planned.tasks.iter().all(|t| t.references.is_empty()));
        assert!(planned.tasks[0].prompt.starts_with("smokestacks "));
        assert_eq!(
            planned.tasks[0].final_paths,
            vec![temp.path().join("pol_001_reference.png")]
        );
        Ok(())
    }

    #[test]
    fn bootstrap_reuses_existing_reference_but_not_a_placeholder() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = FamilyLayout::new(temp.path(), "png");
        let config = PipelineConfig::default();
        let path = layout.reference_path("pol_001");

        write_placeholder(&path)?;
        assert!(matches!(
            plan_bootstrap(&family(), &layout, &config, &DryrunProvider),
            Bootstrap::Planned(_)
        ));

        std::fs::write(&path, b"real art")?;
        assert!(matches!(
            plan_bootstrap(&family(), &layout, &config, &DryrunProvider),
            Bootstrap::Existing(found) if found == path
        ));

        let disabled = PipelineConfig {
            candidates: 0,
            resume: false,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            plan_bootstrap(&family(), &layout, &disabled, &DryrunProvider),
            Bootstrap::Disabled
        ));
        Ok(())
    }

    #[test]
    fn placeholder_winner_is_rejected_and_removed() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("pol_001_reference.png");
        write_placeholder(&path)?;
        let reporter = Reporter::new();

        assert_eq!(
            accept_bootstrap("policies", Some(&selection(path.clone(), true)), &reporter),
            None
        );
        assert!(!path.exists());
        assert_eq!(reporter.failures_for(Stage::Reference).len(), 1);

        std::fs::write(&path, b"real art")?;
        assert_eq!(
            accept_bootstrap("policies", Some(&selection(path.clone(), false)), &reporter),
            Some(path)
        );
        Ok(())
    }
}
