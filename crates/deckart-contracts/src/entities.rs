use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_FAMILY: &str = "cards";
pub const POWER_SUFFIX: &str = "_power";

/// A content record that needs an illustration. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub title: String,
    pub prompt: String,
    /// Power variants share the art and also write `<id>_power`.
    #[serde(default)]
    pub power: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Entity {
    pub fn new(id: impl Into<String>, title: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            prompt: prompt.into(),
            power: false,
            aliases: Vec::new(),
        }
    }

    /// Every id the selected art is written under: the entity id first, then the
    /// power alias and explicit aliases, without duplicates.
    pub fn final_ids(&self) -> Vec<String> {
        let mut ids = vec![self.id.clone()];
        if self.power {
            ids.push(format!("{}{POWER_SUFFIX}", self.id));
        }
        for alias in &self.aliases {
            let alias = alias.trim();
            if alias.is_empty() || ids.iter().any(|existing| existing == alias) {
                continue;
            }
            ids.push(alias.to_string());
        }
        ids
    }

    /// Stem for scratch candidate files.
    pub fn scratch_stem(&self) -> String {
        if self.power {
            format!("{}{POWER_SUFFIX}", self.id)
        } else {
            self.id.clone()
        }
    }
}

/// Entities that share an output directory and a reference image set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFamily {
    pub name: String,
    pub entities: Vec<Entity>,
}

impl EntityFamily {
    pub fn new(name: impl Into<String>, entities: Vec<Entity>) -> Self {
        Self {
            name: name.into(),
            entities,
        }
    }
}

/// Loads card records from a JSONL file and groups them by family in first-seen
/// order. Accepts `art_prompt` or `prompt`, and `family` or `category`.
pub fn load_families(path: &Path) -> anyhow::Result<Vec<EntityFamily>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading cards {}", path.display()))?;
    let mut grouped: IndexMap<String, Vec<Entity>> = IndexMap::new();

    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{} is not valid JSON", path.display(), line_no + 1))?;
        let (family, entity) = entity_from_record(&record)
            .with_context(|| format!("{}:{} is not a card record", path.display(), line_no + 1))?;
        grouped.entry(family).or_default().push(entity);
    }

    Ok(grouped
        .into_iter()
        .map(|(name, entities)| EntityFamily::new(name, entities))
        .collect())
}

fn entity_from_record(record: &Value) -> anyhow::Result<(String, Entity)> {
    let id = string_field(record, &["id"])
        .ok_or_else(|| anyhow::anyhow!("card record is missing `id`"))?;
    let title = string_field(record, &["title"]).unwrap_or_else(|| id.clone());
    let prompt = string_field(record, &["art_prompt", "prompt"])
        .unwrap_or_else(|| format!("Illustration for the card \"{title}\", no readable text."));
    let family = string_field(record, &["family", "category"])
        .unwrap_or_else(|| DEFAULT_FAMILY.to_string());
    let power = record
        .get("power")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let aliases = record
        .get("aliases")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<String>>()
        })
        .unwrap_or_default();

    Ok((
        family,
        Entity {
            id,
            title,
            prompt,
            power,
            aliases,
        },
    ))
}

fn string_field(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        record
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}
