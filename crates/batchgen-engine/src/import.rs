use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use batchgen_contracts::batches::{Batch, EncodedImage, ReferenceImage, MAX_REFERENCE_IMAGES};
use indexmap::IndexMap;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Batch name for files that sit at the top of the dropped selection.
pub const UNTITLED_BATCH_NAME: &str = "Untitled";

const IMAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
];

/// One selected file with its folder-relative path (`Shoots/Cats/a.png`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFile {
    pub relative_path: String,
    pub image: EncodedImage,
    pub source: Option<PathBuf>,
}

impl ImportFile {
    pub fn new(relative_path: impl Into<String>, image: EncodedImage) -> Self {
        Self {
            relative_path: relative_path.into(),
            image,
            source: None,
        }
    }

    fn file_name(&self) -> &str {
        path_segments(&self.relative_path)
            .last()
            .copied()
            .unwrap_or(self.relative_path.as_str())
    }
}

fn path_segments(relative_path: &str) -> Vec<&str> {
    relative_path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// The folder a file is grouped under: its second-to-last path segment.
pub fn group_key(relative_path: &str) -> String {
    let segments = path_segments(relative_path);
    if segments.len() < 2 {
        return UNTITLED_BATCH_NAME.to_string();
    }
    segments[segments.len() - 2].to_string()
}

pub fn mime_for_path(path: &str) -> Option<&'static str> {
    let (_, extension) = path.rsplit_once('.')?;
    let extension = extension.to_ascii_lowercase();
    IMAGE_EXTENSIONS
        .iter()
        .find(|(candidate, _)| *candidate == extension)
        .map(|(_, mime)| *mime)
}

pub fn is_image_path(path: &str) -> bool {
    mime_for_path(path).is_some()
}

/// Groups files into batches by containing folder, in first-seen order.
///
/// Non-image files are dropped and each group keeps at most five images.
pub fn group_into_batches<I>(files: I) -> Vec<Batch>
where
    I: IntoIterator<Item = ImportFile>,
{
    let mut groups: IndexMap<String, Vec<ReferenceImage>> = IndexMap::new();
    for file in files {
        if !is_image_path(&file.relative_path) {
            continue;
        }
        let images = groups.entry(group_key(&file.relative_path)).or_default();
        if images.len() >= MAX_REFERENCE_IMAGES {
            continue;
        }
        let name = file.file_name().to_string();
        images.push(ReferenceImage::new(name, file.source, file.image));
    }
    groups
        .into_iter()
        .map(|(name, images)| Batch::with_images(name, images))
        .collect()
}

/// Walks `root` and builds batches the way a folder drop would.
///
/// Relative paths start with the root folder's own name, so images placed
/// directly in `root` form a batch named after it.
pub fn load_folder(root: &Path) -> Result<Vec<Batch>> {
    if !root.is_dir() {
        bail!("import path is not a directory: {}", root.display());
    }
    let prefix = root
        .file_name()
        .map(|name| name.to_string_lossy().to_string());

    let mut seen: IndexMap<String, usize> = IndexMap::new();
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "skipping unreadable import entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let mut segments: Vec<String> = prefix.iter().cloned().collect();
        segments.extend(
            relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().to_string()),
        );
        let relative_path = segments.join("/");
        if !is_image_path(&relative_path) {
            continue;
        }

        let count = seen.entry(group_key(&relative_path)).or_insert(0);
        if *count >= MAX_REFERENCE_IMAGES {
            debug!(path = %relative_path, "skipping image beyond batch limit");
            continue;
        }
        *count += 1;

        let image = encode_file(entry.path(), &relative_path)?;
        files.push(ImportFile {
            relative_path,
            image,
            source: Some(entry.path().to_path_buf()),
        });
    }
    Ok(group_into_batches(files))
}

/// Reads one image file for adding to, or replacing within, an existing batch.
pub fn reference_image_from_path(path: &Path) -> Result<ReferenceImage> {
    let display = path.to_string_lossy().to_string();
    let image = encode_file(path, &display)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or(display);
    Ok(ReferenceImage::new(name, Some(path.to_path_buf()), image))
}

fn encode_file(path: &Path, label: &str) -> Result<EncodedImage> {
    let Some(mime) = mime_for_path(label) else {
        bail!("not a supported image file: {label}");
    };
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(EncodedImage::from_bytes(mime, &bytes))
}
