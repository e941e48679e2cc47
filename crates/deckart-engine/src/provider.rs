use std::io::Cursor;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use deckart_contracts::config::ApiMode;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeCapabilities {
    /// Images a single call may return; 1 means no batched output.
    pub max_outputs: usize,
    /// Whether more than one reference image may condition a call.
    pub multi_reference: bool,
}

impl ModeCapabilities {
    pub fn single() -> Self {
        Self {
            max_outputs: 1,
            multi_reference: false,
        }
    }

    pub fn supports_multi_output(&self) -> bool {
        self.max_outputs > 1
    }
}

/// Provider-facing generation request. Carries nothing about scheduling: no
/// entity ids, candidate indices or output paths.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub mode: ApiMode,
    pub model: String,
    pub size: String,
    pub quality: Option<String>,
    pub background: Option<String>,
    pub output_format: String,
    pub n: usize,
    pub references: Vec<PathBuf>,
}

impl GenerateRequest {
    /// The same request without any conditioning.
    pub fn unconditioned(&self) -> Self {
        Self {
            mode: ApiMode::Images,
            references: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CritiqueRequest {
    pub model: String,
    pub instructions: String,
    pub candidate: Vec<u8>,
    pub reference: Option<Vec<u8>>,
    pub schema: Value,
}

/// Remote generation/critique service. Every call may fail or stall; callers
/// wrap them in timeouts and retries.
#[async_trait]
pub trait AssetProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self, mode: ApiMode, model: &str) -> ModeCapabilities;

    async fn generate(&self, request: &GenerateRequest) -> Result<Vec<Vec<u8>>>;

    /// Returns the structured judgment; expected to carry an integer `rating`.
    async fn critique(&self, request: &CritiqueRequest) -> Result<Value>;
}

pub const RATING_MIN: i64 = 1;
pub const RATING_MAX: i64 = 10;

pub fn rating_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "rating": {
                "type": "integer",
                "minimum": RATING_MIN,
                "maximum": RATING_MAX,
                "description": "Overall quality of the candidate illustration."
            },
            "reason": {"type": "string"}
        },
        "required": ["rating", "reason"],
        "additionalProperties": false
    })
}

pub fn critique_instructions(title: &str, prompt: &str, has_reference: bool) -> String {
    let mut text = format!(
        "You are judging a candidate illustration for the card \"{title}\".\n\
         Art brief: {prompt}\n\
         Rate from {RATING_MIN} (unusable) to {RATING_MAX} (excellent) for fidelity to the brief, \
         composition, absence of readable text or artifacts, and print suitability."
    );
    if has_reference {
        text.push_str(
            "\nThe second image is the family reference: reward candidates that match its style.",
        );
    }
    text
}

/// Offline provider: solid-colour images derived from the prompt, ratings derived
/// from the image bytes. Used when no API credentials are available.
pub struct DryrunProvider;

#[async_trait]
impl AssetProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn capabilities(&self, mode: ApiMode, _model: &str) -> ModeCapabilities {
        match mode {
            ApiMode::Responses => ModeCapabilities {
                max_outputs: 1,
                multi_reference: true,
            },
            ApiMode::Images | ApiMode::Edits => ModeCapabilities {
                max_outputs: 10,
                multi_reference: true,
            },
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Vec<Vec<u8>>> {
        let (width, height) = parse_dims(&request.size);
        let salt = request
            .references
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect::<Vec<String>>()
            .join(",");
        let mut images = Vec::new();
        for idx in 0..request.n.max(1) {
            let color = color_from_prompt(&format!("{}|{salt}", request.prompt), idx as u64);
            images.push(render_solid_png(width, height, color)?);
        }
        Ok(images)
    }

    async fn critique(&self, request: &CritiqueRequest) -> Result<Value> {
        if request.candidate.is_empty() {
            bail!("dryrun critique received an empty candidate");
        }
        let digest = Sha256::digest(&request.candidate);
        let span = (RATING_MAX - RATING_MIN + 1) as u8;
        let rating = RATING_MIN + i64::from(digest[0] % span);
        Ok(json!({"rating": rating, "reason": "dryrun"}))
    }
}

pub(crate) fn render_solid_png(width: u32, height: u32, color: (u8, u8, u8)) -> Result<Vec<u8>> {
    let (r, g, b) = color;
    let image = RgbImage::from_pixel(width.max(1), height.max(1), Rgb([r, g, b]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode png")?;
    Ok(out.into_inner())
}

pub(crate) fn parse_dims(size: &str) -> (u32, u32) {
    let raw = size.trim().to_ascii_lowercase();
    if let Some((w, h)) = raw.split_once('x') {
        let width = w.trim().parse::<u32>().unwrap_or(1024);
        let height = h.trim().parse::<u32>().unwrap_or(1024);
        return (width.max(1), height.max(1));
    }
    (1024, 1024)
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(n: usize) -> GenerateRequest {
        GenerateRequest {
            prompt: "lighthouse".to_string(),
            mode: ApiMode::Images,
            model: "dryrun-image".to_string(),
            size: "16x8".to_string(),
            quality: None,
            background: None,
            output_format: "png".to_string(),
            n,
            references: Vec::new(),
        }
    }

    #[tokio::test]
    async fn dryrun_generates_requested_count_of_distinct_pngs() -> Result<()> {
        let images = DryrunProvider.generate(&request(3)).await?;
        assert_eq!(images.len(), 3);
        assert_ne!(images[0], images[1]);

        let decoded = image::load_from_memory(&images[0])?;
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
        Ok(())
    }

    #[tokio::test]
    async fn dryrun_rating_is_stable_and_in_range() -> Result<()> {
        let images = DryrunProvider.generate(&request(1)).await?;
        let critique = CritiqueRequest {
            model: "dryrun-judge".to_string(),
            instructions: critique_instructions("Lighthouse", "lighthouse", false),
            candidate: images[0].clone(),
            reference: None,
            schema: rating_schema(),
        };
        let first = DryrunProvider.critique(&critique).await?;
        let second = DryrunProvider.critique(&critique).await?;
        assert_eq!(first, second);

        let rating = first["rating"].as_i64().unwrap_or_default();
        assert!((RATING_MIN..=RATING_MAX).contains(&rating));
        Ok(())
    }

    #[test]
    fn unconditioned_drops_references_and_mode() {
        let mut conditioned = request(2);
        conditioned.mode = ApiMode::Edits;
        conditioned.references = vec![PathBuf::from("ref.png")];

        let plain = conditioned.unconditioned();
        assert_eq!(plain.mode, ApiMode::Images);
        assert!(plain.references.is_empty());
        assert_eq!(plain.n, 2);
    }

    #[test]
    fn parse_dims_falls_back_to_square() {
        assert_eq!(parse_dims("1536x1024"), (1536, 1024));
        assert_eq!(parse_dims("auto"), (1024, 1024));
        assert_eq!(parse_dims("0x5"), (1, 5));
    }
}
