mod store;

use std::fmt;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub use store::{BatchStore, StoreError, StoreSnapshot};

/// Maximum number of reference images a batch may hold.
pub const MAX_REFERENCE_IMAGES: usize = 5;

/// Prompt used for fresh generation when a batch carries no custom prompt.
pub const DEFAULT_PROMPT: &str = "Create a professional product photograph based on the provided \
reference images. Keep the subject's design, colors, materials and proportions faithful to the \
references, place it in a clean, well-lit studio setting, and produce a single polished, \
high-resolution image.";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Normal,
    Pro,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Normal, Tier::Pro];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Pro => "pro",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Normal => 0,
            Self::Pro => 1,
        }
    }

    /// Folder / file label used by exports and downloads.
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Pro => "Pro",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" | "standard" | "n" => Some(Self::Normal),
            "pro" | "p" => Some(Self::Pro),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    #[default]
    Idle,
    Processing,
    Completed,
    Error,
    Stopping,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopping => "stopping",
        }
    }

    /// `processing` or `stopping`: a run still owns the batch.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Processing | Self::Stopping)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoImageReturned,
    ProKeyRequired,
    GenerationFailed,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoImageReturned => "no_image_returned",
            Self::ProKeyRequired => "pro_key_required",
            Self::GenerationFailed => "generation_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl BatchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn needs_entitlement(&self) -> bool {
        self.kind == FailureKind::ProKeyRequired
    }
}

/// Encoded image handle in `data:<mime>;base64,<payload>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedImage(String);

impl EncodedImage {
    pub fn from_base64(mime_type: &str, data: &str) -> Self {
        let mime = mime_type.trim();
        let mime = if mime.is_empty() { "image/png" } else { mime };
        Self(format!("data:{mime};base64,{}", data.trim()))
    }

    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        Self::from_base64(mime_type, &BASE64.encode(bytes))
    }

    /// Accepts a data URL; anything else is treated as a bare PNG payload.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("data:") && trimmed.contains(";base64,") {
            return Self(trimmed.to_string());
        }
        Self::from_base64("image/png", trimmed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn mime_type(&self) -> &str {
        self.0
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
            .map(|(mime, _)| mime)
            .unwrap_or("image/png")
    }

    pub fn base64_data(&self) -> &str {
        self.0
            .split_once(";base64,")
            .map(|(_, data)| data)
            .unwrap_or(self.0.as_str())
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.base64_data().as_bytes())
    }

    pub fn extension(&self) -> &'static str {
        let lowered = self.mime_type().to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        if lowered.contains("gif") {
            return "gif";
        }
        "png"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub id: ImageId,
    pub name: String,
    pub source: Option<PathBuf>,
    pub image: EncodedImage,
}

impl ReferenceImage {
    pub fn new(name: impl Into<String>, source: Option<PathBuf>, image: EncodedImage) -> Self {
        Self {
            id: ImageId::new(),
            name: name.into(),
            source,
            image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub images: Vec<ReferenceImage>,
    pub status: BatchStatus,
    pub processing_mode: Option<Tier>,
    pub results_normal: Vec<EncodedImage>,
    pub results_pro: Vec<EncodedImage>,
    pub custom_prompt: Option<String>,
    pub error: Option<BatchFailure>,
    /// Tiers with a run in flight. `status` and `processing_mode` are shared
    /// between tiers; this is what guards a tier against a second run.
    pub running_tiers: [bool; 2],
}

impl Batch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: BatchId::new(),
            name: name.into(),
            images: Vec::new(),
            status: BatchStatus::Idle,
            processing_mode: None,
            results_normal: Vec::new(),
            results_pro: Vec::new(),
            custom_prompt: None,
            error: None,
            running_tiers: [false; 2],
        }
    }

    /// Builds a batch from an image list, keeping only the first five.
    pub fn with_images(name: impl Into<String>, images: Vec<ReferenceImage>) -> Self {
        let mut batch = Self::new(name);
        batch.images = images.into_iter().take(MAX_REFERENCE_IMAGES).collect();
        batch
    }

    pub fn results(&self, tier: Tier) -> &Vec<EncodedImage> {
        match tier {
            Tier::Normal => &self.results_normal,
            Tier::Pro => &self.results_pro,
        }
    }

    pub fn results_mut(&mut self, tier: Tier) -> &mut Vec<EncodedImage> {
        match tier {
            Tier::Normal => &mut self.results_normal,
            Tier::Pro => &mut self.results_pro,
        }
    }

    pub fn is_tier_running(&self, tier: Tier) -> bool {
        self.running_tiers[tier.index()]
    }

    pub fn set_tier_running(&mut self, tier: Tier, running: bool) {
        self.running_tiers[tier.index()] = running;
    }

    pub fn has_results(&self) -> bool {
        !self.results_normal.is_empty() || !self.results_pro.is_empty()
    }

    pub fn effective_prompt(&self) -> &str {
        self.custom_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_PROMPT)
    }

    pub fn encoded_images(&self) -> Vec<EncodedImage> {
        self.images.iter().map(|image| image.image.clone()).collect()
    }

    pub fn add_image(&mut self, image: ReferenceImage) -> Result<(), StoreError> {
        if self.images.len() >= MAX_REFERENCE_IMAGES {
            return Err(StoreError::TooManyImages {
                batch: self.id.clone(),
                limit: MAX_REFERENCE_IMAGES,
            });
        }
        self.images.push(image);
        Ok(())
    }

    /// Swaps the payload at `index`; the slot keeps its id.
    pub fn replace_image(&mut self, index: usize, image: ReferenceImage) -> Result<(), StoreError> {
        let len = self.images.len();
        let Some(slot) = self.images.get_mut(index) else {
            return Err(StoreError::IndexOutOfRange { index, len });
        };
        let id = slot.id.clone();
        *slot = ReferenceImage { id, ..image };
        Ok(())
    }

    pub fn remove_image(&mut self, index: usize) -> Result<ReferenceImage, StoreError> {
        if index >= self.images.len() {
            return Err(StoreError::IndexOutOfRange {
                index,
                len: self.images.len(),
            });
        }
        Ok(self.images.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(name: &str) -> ReferenceImage {
        ReferenceImage::new(name, None, EncodedImage::from_bytes("image/png", name.as_bytes()))
    }

    #[test]
    fn encoded_image_exposes_mime_and_payload() {
        let image = EncodedImage::from_bytes("image/jpeg", b"abc");
        assert_eq!(image.as_str(), "data:image/jpeg;base64,YWJj");
        assert_eq!(image.mime_type(), "image/jpeg");
        assert_eq!(image.base64_data(), "YWJj");
        assert_eq!(image.decode().unwrap_or_default(), b"abc".to_vec());
        assert_eq!(image.extension(), "jpg");
    }

    #[test]
    fn encoded_image_parse_wraps_bare_payload() {
        let image = EncodedImage::parse("YWJj");
        assert_eq!(image.mime_type(), "image/png");
        assert_eq!(image.base64_data(), "YWJj");
        assert_eq!(EncodedImage::parse(image.as_str()), image);
    }

    #[test]
    fn with_images_truncates_to_five() {
        let images = (0..8).map(|idx| reference(&format!("{idx}.png"))).collect();
        let batch = Batch::with_images("Cats", images);
        assert_eq!(batch.images.len(), MAX_REFERENCE_IMAGES);
        assert_eq!(batch.images[4].name, "4.png");
    }

    #[test]
    fn add_image_rejects_sixth_image() {
        let images = (0..5).map(|idx| reference(&format!("{idx}.png"))).collect();
        let mut batch = Batch::with_images("Cats", images);
        let err = batch.add_image(reference("extra.png")).err();
        assert!(matches!(err, Some(StoreError::TooManyImages { limit: 5, .. })));
        assert_eq!(batch.images.len(), 5);
    }

    #[test]
    fn replace_image_keeps_slot_id() {
        let mut batch = Batch::with_images("Cats", vec![reference("a.png"), reference("b.png")]);
        let original_id = batch.images[1].id.clone();
        batch
            .replace_image(1, reference("c.png"))
            .unwrap_or_else(|err| panic!("replace failed: {err}"));
        assert_eq!(batch.images[1].id, original_id);
        assert_eq!(batch.images[1].name, "c.png");
        assert!(batch.replace_image(7, reference("d.png")).is_err());
    }

    #[test]
    fn tier_running_flags_are_independent() {
        let mut batch = Batch::new("Cats");
        assert!(!batch.is_tier_running(Tier::Normal));
        batch.set_tier_running(Tier::Pro, true);
        assert!(batch.is_tier_running(Tier::Pro));
        assert!(!batch.is_tier_running(Tier::Normal));
        batch.set_tier_running(Tier::Pro, false);
        assert_eq!(batch.running_tiers, [false, false]);
    }

    #[test]
    fn results_accessor_selects_tier_sequence() {
        let mut batch = Batch::new("Cats");
        batch
            .results_mut(Tier::Pro)
            .push(EncodedImage::from_bytes("image/png", b"pro"));
        assert!(batch.results(Tier::Normal).is_empty());
        assert_eq!(batch.results(Tier::Pro).len(), 1);
        assert!(batch.has_results());
    }

    #[test]
    fn effective_prompt_falls_back_to_default() {
        let mut batch = Batch::new("Cats");
        assert_eq!(batch.effective_prompt(), DEFAULT_PROMPT);
        batch.custom_prompt = Some("   ".to_string());
        assert_eq!(batch.effective_prompt(), DEFAULT_PROMPT);
        batch.custom_prompt = Some(" studio shot ".to_string());
        assert_eq!(batch.effective_prompt(), "studio shot");
    }

    #[test]
    fn tier_parse_accepts_aliases() {
        assert_eq!(Tier::parse("PRO"), Some(Tier::Pro));
        assert_eq!(Tier::parse("normal"), Some(Tier::Normal));
        assert_eq!(Tier::parse("ultra"), None);
    }
}
