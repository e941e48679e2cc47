use std::env;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use deckart_contracts::config::ApiMode;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::provider::{AssetProvider, CritiqueRequest, GenerateRequest, ModeCapabilities};
use crate::scheduler::Permanent;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_RESPONSES_MODEL: &str = "gpt-4.1-mini";
const MAX_OUTPUTS: usize = 10;

pub struct OpenAiProvider {
    api_base: String,
    api_key: String,
    responses_model: String,
    http: Client,
}

impl OpenAiProvider {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            responses_model: DEFAULT_RESPONSES_MODEL.to_string(),
            http: Client::new(),
        }
    }

    /// `None` when neither `OPENAI_API_KEY` nor `OPENAI_API_KEY_BACKUP` is set.
    pub fn from_env() -> Option<Self> {
        let api_key = api_key_from_env()?;
        let api_base =
            non_empty_env("OPENAI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Some(Self::new(api_base, api_key))
    }

    /// Text model driving the image-generation tool in `responses` mode.
    pub fn with_responses_model(mut self, model: impl Into<String>) -> Self {
        self.responses_model = model.into();
        self
    }

    async fn generate_images(&self, request: &GenerateRequest) -> Result<Vec<Vec<u8>>> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(request.model));
        payload.insert("prompt".to_string(), json!(request.prompt));
        payload.insert("n".to_string(), json!(request.n.max(1)));
        for (key, value) in image_options(request) {
            payload.insert(key.to_string(), Value::String(value));
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&Value::Object(payload))
            .send()
            .await
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response).await?;
        self.extract_image_items(&parsed).await
    }

    async fn edit_images(&self, request: &GenerateRequest) -> Result<Vec<Vec<u8>>> {
        if request.references.is_empty() {
            bail!("OpenAI image edits require at least one reference image");
        }
        let endpoint = format!("{}/images/edits", self.api_base);
        let mut form = Form::new()
            .text("model", request.model.clone())
            .text("prompt", request.prompt.clone())
            .text("n", request.n.max(1).to_string());
        for (key, value) in image_options(request) {
            form = form.text(key, value);
        }
        for path in &request.references {
            form = form.part("image[]", image_part(path)?);
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("OpenAI edits request failed")?;
        let parsed = response_json_or_error("OpenAI edits", response).await?;
        self.extract_image_items(&parsed).await
    }

    async fn respond_with_image(&self, request: &GenerateRequest) -> Result<Vec<Vec<u8>>> {
        let payload = self.responses_image_payload(request)?;
        let parsed = self.post_responses(&payload).await?;
        let images = extract_generated_images(&parsed)?;
        if images.is_empty() {
            bail!("OpenAI responses call produced no image");
        }
        Ok(images)
    }

    fn responses_image_payload(&self, request: &GenerateRequest) -> Result<Value> {
        let mut tool = Map::new();
        tool.insert("type".to_string(), json!("image_generation"));
        tool.insert("model".to_string(), json!(request.model));
        for (key, value) in image_options(request) {
            tool.insert(key.to_string(), Value::String(value));
        }
        let mut content = vec![json!({"type": "input_text", "text": request.prompt})];
        for path in &request.references {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            content.push(json!({"type": "input_image", "image_url": data_url(&bytes)}));
        }
        Ok(json!({
            "model": self.responses_model,
            "input": [{"role": "user", "content": content}],
            "tools": [Value::Object(tool)],
            "tool_choice": {"type": "image_generation"},
        }))
    }

    async fn post_responses(&self, payload: &Value) -> Result<Value> {
        let endpoint = format!("{}/responses", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        response_json_or_error("OpenAI responses", response).await
    }

    async fn extract_image_items(&self, response_payload: &Value) -> Result<Vec<Vec<u8>>> {
        let rows = response_payload
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::new();
        for row in rows {
            if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
                let bytes = BASE64
                    .decode(b64.as_bytes())
                    .context("OpenAI image base64 decode failed")?;
                out.push(bytes);
                continue;
            }
            if let Some(url) = row.get("url").and_then(Value::as_str) {
                out.push(self.download_image(url).await?);
            }
        }
        Ok(out)
    }

    async fn download_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed downloading provider image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            bail!(
                "provider image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        Ok(response
            .bytes()
            .await
            .context("failed reading provider image bytes")?
            .to_vec())
    }
}

#[async_trait]
impl AssetProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn capabilities(&self, mode: ApiMode, model: &str) -> ModeCapabilities {
        let model = model.trim().to_ascii_lowercase();
        match mode {
            ApiMode::Responses => ModeCapabilities {
                max_outputs: 1,
                multi_reference: true,
            },
            ApiMode::Images if model.starts_with("dall-e-3") => ModeCapabilities::single(),
            ApiMode::Edits if model.starts_with("dall-e") => ModeCapabilities {
                max_outputs: MAX_OUTPUTS,
                multi_reference: false,
            },
            ApiMode::Images | ApiMode::Edits => ModeCapabilities {
                max_outputs: MAX_OUTPUTS,
                multi_reference: true,
            },
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Vec<Vec<u8>>> {
        debug!(
            mode = request.mode.as_str(),
            model = %request.model,
            n = request.n,
            references = request.references.len(),
            "openai generate"
        );
        let images = match request.mode {
            ApiMode::Images => self.generate_images(request).await?,
            ApiMode::Edits => self.edit_images(request).await?,
            ApiMode::Responses => self.respond_with_image(request).await?,
        };
        Ok(images.into_iter().take(request.n.max(1)).collect())
    }

    async fn critique(&self, request: &CritiqueRequest) -> Result<Value> {
        let mut content = vec![
            json!({"type": "input_text", "text": "Candidate illustration:"}),
            json!({"type": "input_image", "image_url": data_url(&request.candidate)}),
        ];
        if let Some(reference) = request.reference.as_deref() {
            content.push(json!({"type": "input_text", "text": "Family reference:"}));
            content.push(json!({"type": "input_image", "image_url": data_url(reference)}));
        }
        let payload = json!({
            "model": request.model,
            "instructions": request.instructions,
            "input": [{"role": "user", "content": content}],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": "candidate_rating",
                    "schema": request.schema,
                    "strict": true,
                }
            },
        });

        let parsed = self.post_responses(&payload).await?;
        let text = output_text(&parsed)
            .ok_or_else(|| anyhow!("OpenAI critique returned no output text"))?;
        serde_json::from_str(&text).with_context(|| {
            format!(
                "OpenAI critique is not valid JSON: {}",
                truncate_text(&text, 200)
            )
        })
    }
}

fn image_options(request: &GenerateRequest) -> Vec<(&'static str, String)> {
    let mut options = vec![("size", normalize_openai_size(&request.size))];
    let gpt_image = is_openai_gpt_image_model(&request.model);
    if let Some(quality) = request
        .quality
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
    {
        options.push(("quality", quality.to_string()));
    }
    if gpt_image {
        if let Some(format) = normalize_openai_output_format(&request.output_format) {
            options.push(("output_format", format.to_string()));
        }
        if let Some(background) = request
            .background
            .as_deref()
            .and_then(normalize_openai_background)
        {
            options.push(("background", background.to_string()));
        }
        options.push(("moderation", "low".to_string()));
    }
    options
}

fn image_part(path: &Path) -> Result<Part> {
    let bytes = std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("image.png")
        .to_string();
    let mut part = Part::bytes(bytes).file_name(file_name);
    if let Some(mime) = mime_for_path(path) {
        part = part
            .mime_str(mime)
            .with_context(|| format!("invalid mime '{mime}' for {}", path.display()))?;
    }
    Ok(part)
}

fn data_url(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/png");
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

/// Decodes every `image_generation_call` result in a responses payload.
fn extract_generated_images(payload: &Value) -> Result<Vec<Vec<u8>>> {
    let items = payload
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::new();
    for item in items {
        if item.get("type").and_then(Value::as_str) != Some("image_generation_call") {
            continue;
        }
        let Some(result) = item.get("result").and_then(Value::as_str) else {
            continue;
        };
        let encoded = match result.split_once(',') {
            Some((meta, data)) if meta.starts_with("data:") => data,
            _ => result,
        };
        out.push(
            BASE64
                .decode(encoded.trim().as_bytes())
                .context("OpenAI responses image base64 decode failed")?,
        );
    }
    Ok(out)
}

fn output_text(payload: &Value) -> Option<String> {
    if let Some(text) = payload.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    let mut parts = Vec::new();
    for item in payload.get("output").and_then(Value::as_array)? {
        let Some(content) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in content {
            if part.get("type").and_then(Value::as_str) == Some("output_text") {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    parts.push(text);
                }
            }
        }
    }
    (!parts.is_empty()).then(|| parts.concat())
}

async fn response_json_or_error(provider: &str, response: Response) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .await
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        let message = format!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
        // Rejected requests fail the same way on every retry.
        if status.is_client_error() && code != 408 && code != 429 {
            return Err(Permanent(message).into());
        }
        bail!(message);
    }
    serde_json::from_str(&body).with_context(|| format!("{provider} returned invalid JSON payload"))
}

/// Flattens an error and its causes into one line, skipping repeats.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn normalize_openai_size(raw: &str) -> String {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "" | "square" | "1:1" => return "1024x1024".to_string(),
        "auto" | "default" => return "auto".to_string(),
        "portrait" | "tall" => return "1024x1536".to_string(),
        "landscape" | "wide" => return "1536x1024".to_string(),
        _ => {}
    }

    let ratio = if let Some((width, height)) = parse_openai_dims(&normalized) {
        let key = format!("{width}x{height}");
        if matches!(key.as_str(), "1024x1024" | "1024x1536" | "1536x1024") {
            return key;
        }
        f64::from(width) / f64::from(height)
    } else if let Some((left, right)) = normalized.split_once(':') {
        match (left.trim().parse::<u32>(), right.trim().parse::<u32>()) {
            (Ok(left), Ok(right)) if left > 0 && right > 0 => f64::from(left) / f64::from(right),
            _ => {
                warn!(size = raw, "OpenAI size unsupported; using 1024x1024");
                return "1024x1024".to_string();
            }
        }
    } else {
        warn!(size = raw, "OpenAI size unsupported; using 1024x1024");
        return "1024x1024".to_string();
    };

    let candidates = [
        ("1024x1024", 1.0f64),
        ("1024x1536", 1024f64 / 1536f64),
        ("1536x1024", 1536f64 / 1024f64),
    ];
    let mut best_key = "1024x1024";
    let mut best_delta = f64::MAX;
    for (key, value) in candidates {
        let delta = (value - ratio).abs();
        if delta < best_delta {
            best_key = key;
            best_delta = delta;
        }
    }
    debug!(size = raw, snapped = best_key, "OpenAI size snapped");
    best_key.to_string()
}

fn parse_openai_dims(raw: &str) -> Option<(u32, u32)> {
    let (left, right) = raw.split_once('x')?;
    let width = left.trim().parse::<u32>().ok()?;
    let height = right.trim().parse::<u32>().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

fn normalize_openai_output_format(raw: &str) -> Option<&'static str> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.strip_prefix("image/").unwrap_or(&normalized) {
        "png" => Some("png"),
        "jpg" | "jpeg" => Some("jpeg"),
        "webp" => Some("webp"),
        _ => None,
    }
}

fn normalize_openai_background(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "auto" => Some("auto"),
        "transparent" => Some("transparent"),
        "opaque" => Some("opaque"),
        _ => None,
    }
}

fn is_openai_gpt_image_model(model: &str) -> bool {
    model.trim().to_ascii_lowercase().starts_with("gpt-image")
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn api_key_from_env() -> Option<String> {
    non_empty_env("OPENAI_API_KEY").or_else(|| non_empty_env("OPENAI_API_KEY_BACKUP"))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
