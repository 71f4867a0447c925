//! Screenshot comparison
//!
//! The orchestrator only sees the `Comparator` trait. `PixelComparator` is
//! the default: exact match on bytes or decoded pixels, with a diff image
//! written for every mismatch when a failure directory is configured.

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};
use crate::store::{screenshot_keys, FailureArtifacts};

/// Colour of differing pixels in a diff image
const DIFF_HIGHLIGHT: Rgba<u8> = Rgba([255, 0, 255, 255]);

/// Result of comparing one screenshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ComparisonVerdict {
    Match,
    Mismatch {
        /// Diff image, when a failure directory was configured
        diff: Option<PathBuf>,
    },
    /// Captured now, but no golden exists
    MissingReference,
    /// A golden exists, but nothing was captured
    MissingCandidate,
}

impl ComparisonVerdict {
    pub fn is_match(&self) -> bool {
        matches!(self, ComparisonVerdict::Match)
    }
}

/// Compares a directory of candidates against a directory of references
#[async_trait]
pub trait Comparator: Send + Sync {
    /// Compare every screenshot key found in either directory
    async fn compare(
        &self,
        candidate_dir: &Path,
        reference_dir: &Path,
        failure_dir: Option<&Path>,
    ) -> Result<BTreeMap<String, ComparisonVerdict>>;
}

/// Exact pixel comparison of PNG screenshots
#[derive(Debug, Default, Clone, Copy)]
pub struct PixelComparator;

#[async_trait]
impl Comparator for PixelComparator {
    async fn compare(
        &self,
        candidate_dir: &Path,
        reference_dir: &Path,
        failure_dir: Option<&Path>,
    ) -> Result<BTreeMap<String, ComparisonVerdict>> {
        let candidate_dir = candidate_dir.to_path_buf();
        let reference_dir = reference_dir.to_path_buf();
        let failure_dir = failure_dir.map(Path::to_path_buf);

        // Decoding is CPU bound
        tokio::task::spawn_blocking(move || {
            compare_dirs(&candidate_dir, &reference_dir, failure_dir.as_deref())
        })
        .await
        .map_err(|e| Error::Internal(format!("Comparison task failed: {}", e)))?
    }
}

fn compare_dirs(
    candidate_dir: &Path,
    reference_dir: &Path,
    failure_dir: Option<&Path>,
) -> Result<BTreeMap<String, ComparisonVerdict>> {
    let candidates = screenshot_keys(candidate_dir)?;
    let references = screenshot_keys(reference_dir)?;

    let keys: BTreeSet<&String> = candidates.keys().chain(references.keys()).collect();
    let mut verdicts = BTreeMap::new();

    for key in keys {
        let verdict = match (candidates.get(key), references.get(key)) {
            (Some(candidate), Some(reference)) => {
                compare_one(key, candidate, reference, failure_dir)?
            }
            (Some(_), None) => ComparisonVerdict::MissingReference,
            (None, Some(_)) => ComparisonVerdict::MissingCandidate,
            (None, None) => continue,
        };

        if !verdict.is_match() {
            tracing::debug!(screenshot = %key, ?verdict, "Screenshot differs");
        }
        verdicts.insert(key.clone(), verdict);
    }

    Ok(verdicts)
}

fn compare_one(
    key: &str,
    candidate: &Path,
    reference: &Path,
    failure_dir: Option<&Path>,
) -> Result<ComparisonVerdict> {
    let candidate_bytes = std::fs::read(candidate)?;
    let reference_bytes = std::fs::read(reference)?;
    if candidate_bytes == reference_bytes {
        return Ok(ComparisonVerdict::Match);
    }

    let diff = match (
        image::load_from_memory(&candidate_bytes),
        image::load_from_memory(&reference_bytes),
    ) {
        (Ok(actual), Ok(expected)) => {
            match pixel_diff(&expected.to_rgba8(), &actual.to_rgba8()) {
                None => return Ok(ComparisonVerdict::Match),
                Some(diff) => Some(diff),
            }
        }
        _ => {
            tracing::warn!(screenshot = %key, "Could not decode screenshot, comparing bytes only");
            None
        }
    };

    let Some(failure_dir) = failure_dir else {
        return Ok(ComparisonVerdict::Mismatch { diff: None });
    };

    let artifacts = FailureArtifacts::for_key(failure_dir, key);
    if let Some(parent) = artifacts.diff.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match diff {
        Some(image) => image
            .save_with_format(&artifacts.diff, ImageFormat::Png)
            .map_err(|e| Error::Comparison(format!("writing diff for '{}': {}", key, e)))?,
        None => {
            std::fs::copy(candidate, &artifacts.diff)?;
        }
    }
    std::fs::copy(reference, &artifacts.expected)?;
    std::fs::copy(candidate, &artifacts.actual)?;

    Ok(ComparisonVerdict::Mismatch {
        diff: Some(artifacts.diff),
    })
}

/// Diff image of two screenshots, `None` when every pixel matches
///
/// Differing pixels (and the area covered by only one image) are
/// highlighted; matching pixels are kept at reduced opacity for context.
fn pixel_diff(expected: &RgbaImage, actual: &RgbaImage) -> Option<RgbaImage> {
    let width = expected.width().max(actual.width());
    let height = expected.height().max(actual.height());
    let mut differs = expected.dimensions() != actual.dimensions();

    let mut diff = RgbaImage::new(width, height);
    for (x, y, out) in diff.enumerate_pixels_mut() {
        let e = expected.get_pixel_checked(x, y);
        let a = actual.get_pixel_checked(x, y);
        *out = match (e, a) {
            (Some(e), Some(a)) if e == a => {
                let Rgba([r, g, b, alpha]) = *e;
                Rgba([r, g, b, alpha / 4])
            }
            _ => {
                differs = true;
                DIFF_HIGHLIGHT
            }
        };
    }

    differs.then_some(diff)
}
