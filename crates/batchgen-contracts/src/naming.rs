use crate::batches::{EncodedImage, Tier};

/// Name used when sanitization leaves nothing behind.
pub const FALLBACK_FILE_NAME: &str = "batch";

/// Keeps ASCII letters, digits and spaces, collapses whitespace runs and trims.
pub fn sanitize_file_name(raw: &str) -> String {
    let kept: String = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || ch.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Sanitized name, or [`FALLBACK_FILE_NAME`] when nothing survives.
pub fn file_stem_for(raw: &str) -> String {
    let sanitized = sanitize_file_name(raw);
    if sanitized.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        sanitized
    }
}

/// File name of one exported result inside its tier folder (`Cats_1.png`).
pub fn export_file_name(batch_name: &str, index: usize, image: &EncodedImage) -> String {
    format!(
        "{}_{}.{}",
        file_stem_for(batch_name),
        index + 1,
        image.extension()
    )
}

/// File name for a single-result download (`Cats_Pro_2.png`).
pub fn download_file_name(batch_name: &str, tier: Tier, index: usize, image: &EncodedImage) -> String {
    format!(
        "{}_{}_{}.{}",
        file_stem_for(batch_name),
        tier.label(),
        index + 1,
        image.extension()
    )
}
