use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use batchgen_contracts::batches::{Batch, BatchId, EncodedImage, Tier};
use batchgen_contracts::naming::{download_file_name, export_file_name, file_stem_for};
use sha2::{Digest, Sha256};
use tracing::info;

/// One file of the export tree, relative to the export root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub batch_id: BatchId,
    pub folder: String,
    pub tier: Tier,
    pub file_name: String,
    pub image: EncodedImage,
}

impl ExportEntry {
    pub fn relative_path(&self) -> String {
        format!("{}/{}/{}", self.folder, self.tier.label(), self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFile {
    pub relative_path: String,
    pub bytes: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub root: PathBuf,
    pub batches: usize,
    pub files: Vec<ExportedFile>,
    /// Batches left out because neither tier had results.
    pub skipped: Vec<BatchId>,
}

/// Lays out `<Name>/Normal/<Name>_<n>.<ext>` and `<Name>/Pro/...` for every
/// batch with at least one result. Clashing folder names get a numeric suffix.
pub fn plan_export(batches: &[Batch]) -> Vec<ExportEntry> {
    let mut used: HashSet<String> = HashSet::new();
    let mut entries = Vec::new();
    for batch in batches.iter().filter(|batch| batch.has_results()) {
        let stem = file_stem_for(&batch.name);
        let mut folder = stem.clone();
        let mut suffix = 2;
        while !used.insert(folder.to_ascii_lowercase()) {
            folder = format!("{stem} {suffix}");
            suffix += 1;
        }
        for tier in Tier::ALL {
            for (index, image) in batch.results(tier).iter().enumerate() {
                entries.push(ExportEntry {
                    batch_id: batch.id.clone(),
                    folder: folder.clone(),
                    tier,
                    file_name: export_file_name(&folder, index, image),
                    image: image.clone(),
                });
            }
        }
    }
    entries
}

/// Writes the export tree under `dir`, creating it when missing.
pub fn write_export(batches: &[Batch], dir: &Path) -> Result<ExportReport> {
    let entries = plan_export(batches);
    let mut files = Vec::with_capacity(entries.len());
    for entry in &entries {
        let target = dir
            .join(&entry.folder)
            .join(entry.tier.label())
            .join(&entry.file_name);
        let bytes = write_image(&target, &entry.image)?;
        files.push(ExportedFile {
            relative_path: entry.relative_path(),
            bytes: bytes.len(),
            sha256: sha256_hex(&bytes),
        });
    }

    let exported: HashSet<&BatchId> = entries.iter().map(|entry| &entry.batch_id).collect();
    let skipped: Vec<BatchId> = batches
        .iter()
        .filter(|batch| !exported.contains(&batch.id))
        .map(|batch| batch.id.clone())
        .collect();
    info!(dir = %dir.display(), files = files.len(), batches = exported.len(), "export written");
    Ok(ExportReport {
        root: dir.to_path_buf(),
        batches: exported.len(),
        files,
        skipped,
    })
}

/// Saves a single result as `<Name>_<Tier>_<n>.<ext>` inside `dir`.
pub fn save_result(batch: &Batch, tier: Tier, index: usize, dir: &Path) -> Result<PathBuf> {
    let results = batch.results(tier);
    let Some(image) = results.get(index) else {
        bail!(
            "{} has no {} result #{} ({} available)",
            batch.name,
            tier.label(),
            index + 1,
            results.len()
        );
    };
    let target = dir.join(download_file_name(&batch.name, tier, index, image));
    write_image(&target, image)?;
    Ok(target)
}

fn write_image(target: &Path, image: &EncodedImage) -> Result<Vec<u8>> {
    let bytes = image
        .decode()
        .with_context(|| format!("invalid image payload for {}", target.display()))?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(target, &bytes).with_context(|| format!("failed to write {}", target.display()))?;
    Ok(bytes)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
