use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use batchgen_contracts::batches::{
    BatchFailure, EncodedImage, FailureKind, Tier, DEFAULT_PROMPT, MAX_REFERENCE_IMAGES,
};
use batchgen_contracts::tiers::{TierProfile, TierProfiles};
use image::{ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::config::EngineConfig;

/// Upstream error text that signals the caller's key cannot use the pro tier.
pub const PRO_KEY_ERROR_MARKER: &str = "Requested entity was not found";

const ERROR_TEXT_MAX_CHARS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("the generation service returned no image")]
    NoImageReturned,
    #[error("a pro-capable key is required: {0}")]
    ProKeyRequired(String),
    #[error("{0}")]
    GenerationFailed(String),
}

impl GenerationError {
    /// Classifies an upstream failure message.
    pub fn from_upstream(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains(PRO_KEY_ERROR_MARKER) {
            Self::ProKeyRequired(message)
        } else {
            Self::GenerationFailed(message)
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NoImageReturned => FailureKind::NoImageReturned,
            Self::ProKeyRequired(_) => FailureKind::ProKeyRequired,
            Self::GenerationFailed(_) => FailureKind::GenerationFailed,
        }
    }

    pub fn to_failure(&self) -> BatchFailure {
        BatchFailure::new(self.kind(), self.to_string())
    }
}

/// One generation attempt: fresh (reference images) or refinement (source image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub reference_images: Vec<EncodedImage>,
    pub prompt: Option<String>,
    pub source_image: Option<EncodedImage>,
    pub tier: Tier,
}

impl GenerationRequest {
    pub fn fresh(reference_images: Vec<EncodedImage>, prompt: Option<String>, tier: Tier) -> Self {
        Self {
            reference_images,
            prompt,
            source_image: None,
            tier,
        }
    }

    pub fn refine(source_image: EncodedImage, prompt: impl Into<String>, tier: Tier) -> Self {
        Self {
            reference_images: Vec::new(),
            prompt: Some(prompt.into()),
            source_image: Some(source_image),
            tier,
        }
    }

    pub fn is_refinement(&self) -> bool {
        self.source_image.is_some()
    }

    fn trimmed_prompt(&self) -> Option<&str> {
        self.prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// The text actually sent: fresh requests fall back to the built-in prompt.
    pub fn prompt_text(&self) -> &str {
        match self.trimmed_prompt() {
            Some(prompt) => prompt,
            None if self.is_refinement() => "",
            None => DEFAULT_PROMPT,
        }
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.is_refinement() {
            if self.trimmed_prompt().is_none() {
                return Err(GenerationError::GenerationFailed(
                    "a prompt is required to refine an image".to_string(),
                ));
            }
        } else if self.reference_images.is_empty() {
            return Err(GenerationError::GenerationFailed(
                "no reference images to generate from".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stateless adapter over an image-generation backend; one call, one attempt.
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<EncodedImage, GenerationError>;
}

#[derive(Default)]
pub struct GeneratorRegistry {
    generators: BTreeMap<String, Arc<dyn ImageGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ImageGenerator + 'static>(&mut self, generator: G) {
        self.generators
            .insert(generator.name().to_string(), Arc::new(generator));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageGenerator>> {
        self.generators.get(name.trim()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.generators.keys().cloned().collect()
    }
}

pub fn default_generator_registry(config: &EngineConfig) -> GeneratorRegistry {
    let mut generators = GeneratorRegistry::new();
    generators.register(DryrunGenerator::new());
    generators.register(GeminiGenerator::new(config));
    generators
}

/// Offline generator: a solid-colour PNG derived from the prompt and call count.
pub struct DryrunGenerator {
    calls: AtomicU64,
    size: u32,
}

impl DryrunGenerator {
    pub fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            size: 64,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for DryrunGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<EncodedImage, GenerationError> {
        request.validate()?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut seed_text = format!("{}:{}", request.tier, request.prompt_text());
        if let Some(source) = request.source_image.as_ref() {
            seed_text.push_str(source.base64_data());
        }
        let (r, g, b) = color_from_prompt(&seed_text, call);
        let mut image = RgbImage::new(self.size, self.size);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| GenerationError::GenerationFailed(format!("dryrun encode failed: {err}")))?;
        Ok(EncodedImage::from_bytes("image/png", &bytes))
    }
}

pub struct GeminiGenerator {
    api_base: String,
    api_key: Option<String>,
    pro_api_key: Option<String>,
    profiles: TierProfiles,
    /// A client that failed to build is reported by every `generate` call.
    http: Result<HttpClient, String>,
}

impl GeminiGenerator {
    pub fn new(config: &EngineConfig) -> Self {
        // No client-side timeout: a slow call is only ever ended by the transport.
        let http = HttpClient::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| error_chain_text(&err, ERROR_TEXT_MAX_CHARS));
        if let Err(err) = &http {
            warn!(error = %err, "gemini http client unavailable");
        }
        Self::with_client(config, http)
    }

    fn with_client(config: &EngineConfig, http: Result<HttpClient, String>) -> Self {
        Self {
            api_base: config.api_base.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            pro_api_key: config.pro_api_key.clone(),
            profiles: config.profiles.clone(),
            http,
        }
    }

    fn api_key_for(&self, tier: Tier) -> Option<&str> {
        match tier {
            Tier::Pro => self.pro_api_key.as_deref().or(self.api_key.as_deref()),
            Tier::Normal => self.api_key.as_deref(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }
}

impl ImageGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<EncodedImage, GenerationError> {
        request.validate()?;
        let Some(api_key) = self.api_key_for(request.tier) else {
            return Err(GenerationError::GenerationFailed(
                "GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string(),
            ));
        };
        let http = self.http.as_ref().map_err(|err| {
            GenerationError::GenerationFailed(format!("HTTP client setup failed: {err}"))
        })?;
        let profile = self.profiles.get(request.tier);
        let endpoint = self.endpoint_for_model(&profile.model);
        let payload = build_gemini_payload(request, profile);

        let response = http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .json(&payload)
            .send()
            .map_err(|err| {
                GenerationError::from_upstream(format!(
                    "Gemini request failed: {}",
                    error_chain_text(&err, ERROR_TEXT_MAX_CHARS)
                ))
            })?;

        let status = response.status();
        let body = response.text().map_err(|err| {
            GenerationError::GenerationFailed(format!("Gemini response body read failed: {err}"))
        })?;
        if !status.is_success() {
            return Err(GenerationError::from_upstream(format!(
                "Gemini request failed ({}): {}",
                status.as_u16(),
                upstream_error_message(&body)
            )));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            GenerationError::GenerationFailed(format!("Gemini returned invalid JSON payload: {err}"))
        })?;
        extract_first_image(&parsed).ok_or(GenerationError::NoImageReturned)
    }
}

/// Request body for `generateContent`.
///
/// Images come first, then a single text part. Only the pro tier carries an
/// `imageConfig` block.
pub fn build_gemini_payload(request: &GenerationRequest, profile: &TierProfile) -> Value {
    let mut parts = Vec::new();
    if let Some(source) = request.source_image.as_ref() {
        parts.push(inline_image_part(source));
        parts.push(json!({
            "text": format!("{}\n\n{}", request.prompt_text(), profile.refine_instruction),
        }));
    } else {
        for image in request.reference_images.iter().take(MAX_REFERENCE_IMAGES) {
            parts.push(inline_image_part(image));
        }
        parts.push(json!({ "text": request.prompt_text() }));
    }

    let mut generation_config = Map::new();
    generation_config.insert("responseModalities".to_string(), json!(["IMAGE"]));
    if request.tier == Tier::Pro {
        if let Some(size) = profile.image_size.as_deref() {
            generation_config.insert("imageConfig".to_string(), json!({ "imageSize": size }));
        }
    }

    json!({
        "contents": [{
            "role": "user",
            "parts": parts,
        }],
        "generationConfig": Value::Object(generation_config),
    })
}

/// First inline image part across all candidates, if any.
pub fn extract_first_image(response_payload: &Value) -> Option<EncodedImage> {
    let candidates = response_payload.get("candidates")?.as_array()?;
    for candidate in candidates {
        let Some(parts) = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
        else {
            continue;
        };
        for part in parts {
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            if !mime_type.starts_with("image/") {
                continue;
            }
            return Some(EncodedImage::from_base64(mime_type, data));
        }
    }
    None
}

fn inline_image_part(image: &EncodedImage) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type(),
            "data": image.base64_data(),
        }
    })
}

fn upstream_error_message(body: &str) -> String {
    let structured = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    truncate_text(
        structured.as_deref().unwrap_or(body.trim()),
        ERROR_TEXT_MAX_CHARS,
    )
}

fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(|last| last != trimmed).unwrap_or(true) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
