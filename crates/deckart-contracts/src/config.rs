use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which provider endpoint family a generation call goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMode {
    /// Plain prompt-to-image generation.
    Images,
    /// Edit/compose conditioned on reference images.
    Edits,
    /// Conversational call with an image-generation tool and image inputs.
    Responses,
}

impl ApiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMode::Images => "images",
            ApiMode::Edits => "edits",
            ApiMode::Responses => "responses",
        }
    }

    pub fn is_conditioned(&self) -> bool {
        !matches!(self, ApiMode::Images)
    }
}

/// Concurrency, timeout and retry settings for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLimits {
    /// Maximum in-flight calls; `<= 0` means unbounded.
    #[serde(default = "default_generation_concurrency")]
    pub concurrency: i64,
    /// Per-attempt wall clock timeout in seconds; `<= 0` disables the timeout.
    #[serde(default = "default_generation_timeout")]
    pub timeout_s: f64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

impl StageLimits {
    pub fn generation_default() -> Self {
        Self {
            concurrency: default_generation_concurrency(),
            timeout_s: default_generation_timeout(),
            retry_limit: default_retry_limit(),
        }
    }

    pub fn critique_default() -> Self {
        Self {
            concurrency: 8,
            timeout_s: 60.0,
            retry_limit: default_retry_limit(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_s > 0.0 {
            Duration::try_from_secs_f64(self.timeout_s).ok()
        } else {
            None
        }
    }

    /// Effective concurrency for `task_count` tasks, never zero.
    pub fn effective_concurrency(&self, task_count: usize) -> usize {
        let cap = task_count.max(1);
        if self.concurrency <= 0 {
            return cap;
        }
        usize::try_from(self.concurrency).unwrap_or(cap).min(cap)
    }
}

impl Default for StageLimits {
    fn default() -> Self {
        Self::generation_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_quality")]
    pub quality: Option<String>,
    #[serde(default = "default_background")]
    pub background: Option<String>,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_api_mode")]
    pub api_mode: ApiMode,
    #[serde(default = "default_critique_model")]
    pub critique_model: String,
    /// Text model driving the image tool in `responses` mode.
    #[serde(default = "default_responses_model")]
    pub responses_model: String,
    #[serde(default = "default_candidates")]
    pub candidates: i64,
    #[serde(default = "default_reference_multiplier")]
    pub reference_multiplier: i64,
    #[serde(default = "default_keep")]
    pub keep: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_resume")]
    pub resume: bool,
    #[serde(default = "StageLimits::generation_default")]
    pub generation: StageLimits,
    #[serde(default = "StageLimits::critique_default")]
    pub critique: StageLimits,
    /// Family name to a user supplied reference: a file, a directory, or a
    /// comma separated list of files and globs.
    #[serde(default)]
    pub references: BTreeMap<String, String>,
    /// Generate a reference for families without a user supplied one.
    #[serde(default = "default_bootstrap_references")]
    pub bootstrap_references: bool,
    #[serde(default = "default_reference_prompt_suffix")]
    pub reference_prompt_suffix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            size: default_size(),
            quality: default_quality(),
            background: default_background(),
            output_format: default_output_format(),
            api_mode: default_api_mode(),
            critique_model: default_critique_model(),
            responses_model: default_responses_model(),
            candidates: default_candidates(),
            reference_multiplier: default_reference_multiplier(),
            keep: default_keep(),
            batch_size: default_batch_size(),
            resume: default_resume(),
            generation: StageLimits::generation_default(),
            critique: StageLimits::critique_default(),
            references: BTreeMap::new(),
            bootstrap_references: default_bootstrap_references(),
            reference_prompt_suffix: default_reference_prompt_suffix(),
        }
    }
}

impl PipelineConfig {
    /// Loads a JSON config file and deep-merges it over the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let overrides: Value = serde_json::from_str(&raw)
            .with_context(|| format!("config {} is not valid JSON", path.display()))?;
        Self::from_overrides(overrides)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_overrides(overrides: Value) -> anyhow::Result<Self> {
        let base = serde_json::to_value(Self::default())?;
        let merged = deep_merge(base, overrides);
        Ok(serde_json::from_value(merged)?)
    }

    pub fn reference_candidates(&self) -> i64 {
        self.candidates
            .max(0)
            .saturating_mul(self.reference_multiplier.max(1))
    }

    pub fn extension(&self) -> &'static str {
        match self.output_format.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => "jpg",
            "webp" => "webp",
            _ => "png",
        }
    }
}

/// Objects merge key by key; any other override value replaces the base.
pub fn deep_merge(base: Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(mut base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overrides) => overrides,
    }
}

fn default_model() -> String {
    "gpt-image-1.5".to_string()
}

fn default_size() -> String {
    "1536x1024".to_string()
}

fn default_quality() -> Option<String> {
    Some("high".to_string())
}

fn default_background() -> Option<String> {
    Some("transparent".to_string())
}

fn default_output_format() -> String {
    "png".to_string()
}

fn default_api_mode() -> ApiMode {
    ApiMode::Images
}

fn default_critique_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_candidates() -> i64 {
    3
}

fn default_reference_multiplier() -> i64 {
    2
}

fn default_keep() -> usize {
    2
}

fn default_responses_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_batch_size() -> usize {
    4
}

fn default_resume() -> bool {
    true
}

fn default_bootstrap_references() -> bool {
    true
}

fn default_generation_concurrency() -> i64 {
    4
}

fn default_generation_timeout() -> f64 {
    180.0
}

fn default_retry_limit() -> u32 {
    2
}

fn default_reference_prompt_suffix() -> String {
    "Establish the shared visual style for this card family: consistent palette, lighting and \
     rendering, no readable text."
        .to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn overrides_merge_into_nested_stage_limits() -> anyhow::Result<()> {
        let config = PipelineConfig::from_overrides(json!({
            "candidates": 5,
            "generation": {"concurrency": 2},
            "api_mode": "edits",
            "references": {"policies": "refs/policy.png"}
        }))?;

        assert_eq!(config.candidates, 5);
        assert_eq!(config.generation.concurrency, 2);
        assert_eq!(config.generation.timeout_s, 180.0);
        assert_eq!(config.generation.retry_limit, 2);
        assert_eq!(config.critique, StageLimits::critique_default());
        assert_eq!(config.api_mode, ApiMode::Edits);
        assert_eq!(config.references["policies"], "refs/policy.png");
        assert_eq!(config.model, "gpt-image-1.5");
        assert_eq!(config.responses_model, "gpt-4.1-mini");
        Ok(())
    }

    #[test]
    fn load_reads_json_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"keep": 0, "resume": false, "background": null}"#)?;

        let config = PipelineConfig::load(&path)?;
        assert_eq!(config.keep, 0);
        assert!(!config.resume);
        assert_eq!(config.background, None);
        Ok(())
    }

    #[test]
    fn load_rejects_invalid_json() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{nope")?;

        assert!(PipelineConfig::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn stage_limits_treat_non_positive_values_as_unbounded() {
        let limits = StageLimits {
            concurrency: 0,
            timeout_s: 0.0,
            retry_limit: 1,
        };
        assert_eq!(limits.effective_concurrency(7), 7);
        assert_eq!(limits.effective_concurrency(0), 1);
        assert_eq!(limits.timeout(), None);

        let capped = StageLimits {
            concurrency: 16,
            timeout_s: 1.5,
            retry_limit: 0,
        };
        assert_eq!(capped.effective_concurrency(3), 3);
        assert_eq!(capped.timeout(), Some(Duration::from_millis(1500)));

        let forever = StageLimits {
            timeout_s: 1e30,
            ..StageLimits::critique_default()
        };
        assert_eq!(forever.timeout(), None);
        let infinite = StageLimits {
            timeout_s: f64::INFINITY,
            ..StageLimits::critique_default()
        };
        assert_eq!(infinite.timeout(), None);
    }

    #[test]
    fn reference_candidates_scale_with_multiplier() {
        let config = PipelineConfig {
            candidates: 3,
            reference_multiplier: 2,
            ..PipelineConfig::default()
        };
        assert_eq!(config.reference_candidates(), 6);

        let disabled = PipelineConfig {
            candidates: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(disabled.reference_candidates(), 0);
    }
}
