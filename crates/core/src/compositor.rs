//! Final image assembly from per-region artifacts.
//!
//! The renderer already places each region's pixels at their final position
//! inside a full-frame transparent still, so assembly is plain source-over
//! layering at the origin with no geometric placement.

use std::path::{Path, PathBuf};

use image::{DynamicImage, RgbaImage};

use crate::error::CoreError;
use crate::naming::{artifact_name, is_artifact_of};
use crate::region::Region;

/// Outcome of a successful composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeReport {
    pub output: PathBuf,
    /// Number of artifacts layered into the output.
    pub layers: usize,
    /// Regions of the run that had no artifact.
    pub missing: usize,
    pub width: u32,
    pub height: u32,
    /// Artifacts deleted after the output was written.
    pub removed: usize,
}

/// List the artifacts of scene `stem` in `dir`, sorted by file name.
///
/// The sort gives a fixed layering order within a run; for
/// non-overlapping regions the order does not affect the result.
pub fn list_artifacts(dir: &Path, stem: &str) -> Result<Vec<PathBuf>, CoreError> {
    let entries = std::fs::read_dir(dir).map_err(|e| CoreError::io(dir, e))?;

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CoreError::io(dir, e))?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| is_artifact_of(stem, n));
        if matches && path.is_file() {
            artifacts.push(path);
        }
    }
    artifacts.sort();
    Ok(artifacts)
}

/// Layer `artifacts` in order onto a canvas seeded with the first one.
///
/// The canvas grows to the largest width and height seen; pixels it gains
/// start fully transparent.
pub fn composite(artifacts: &[PathBuf]) -> Result<RgbaImage, CoreError> {
    let (first, rest) = artifacts
        .split_first()
        .ok_or_else(|| CoreError::NoArtifacts("<empty list>".to_string()))?;

    let mut canvas = open_rgba(first)?;
    for path in rest {
        let layer = open_rgba(path)?;
        if layer.width() > canvas.width() || layer.height() > canvas.height() {
            canvas = grow(&canvas, layer.width(), layer.height());
        }
        image::imageops::overlay(&mut canvas, &layer, 0, 0);
    }
    Ok(canvas)
}

/// Composite the artifacts of `regions` in `dir` and write the result to `output`.
///
/// Only the artifact names of `regions` are considered, so stills left in
/// `dir` by other runs never reach the output. Regions without an artifact
/// are counted in [`CompositeReport::missing`]. With `cleanup` set the
/// artifacts are deleted once the output is on disk; a failed deletion is
/// logged and does not fail the composite.
pub fn composite_dir(
    dir: &Path,
    stem: &str,
    regions: &[Region],
    output: &Path,
    cleanup: bool,
) -> Result<CompositeReport, CoreError> {
    let (mut artifacts, absent): (Vec<PathBuf>, Vec<PathBuf>) = regions
        .iter()
        .map(|region| dir.join(artifact_name(stem, region)))
        .partition(|path| path.is_file());
    artifacts.sort();
    if artifacts.is_empty() {
        return Err(CoreError::NoArtifacts(dir.display().to_string()));
    }
    for path in &absent {
        tracing::warn!(path = %path.display(), "Region artifact missing from composite");
    }

    let canvas = composite(&artifacts)?;
    let (width, height) = canvas.dimensions();
    save(canvas, output)?;

    tracing::info!(
        output = %output.display(),
        layers = artifacts.len(),
        missing = absent.len(),
        width,
        height,
        "Composite written",
    );

    let removed = if cleanup { remove_all(&artifacts) } else { 0 };

    Ok(CompositeReport {
        output: output.to_path_buf(),
        layers: artifacts.len(),
        missing: absent.len(),
        width,
        height,
        removed,
    })
}

/// Delete every artifact of `stem` in `dir`, returning how many were removed.
///
/// A missing `dir` counts as already clear.
pub fn clear_artifacts(dir: &Path, stem: &str) -> Result<usize, CoreError> {
    if !dir.exists() {
        return Ok(0);
    }
    let artifacts = list_artifacts(dir, stem)?;
    for path in &artifacts {
        std::fs::remove_file(path).map_err(|e| CoreError::io(path, e))?;
    }
    Ok(artifacts.len())
}

fn remove_all(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact");
            }
        }
    }
    removed
}

fn open_rgba(path: &Path) -> Result<RgbaImage, CoreError> {
    image::open(path)
        .map(|img| img.into_rgba8())
        .map_err(|source| CoreError::Image {
            path: path.display().to_string(),
            source,
        })
}

fn grow(canvas: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let mut grown = RgbaImage::new(width.max(canvas.width()), height.max(canvas.height()));
    image::imageops::replace(&mut grown, canvas, 0, 0);
    grown
}

/// JPEG has no alpha channel, so it is flattened before encoding.
fn save(canvas: RgbaImage, output: &Path) -> Result<(), CoreError> {
    let is_jpeg = output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));

    let result = if is_jpeg {
        DynamicImage::ImageRgba8(canvas).to_rgb8().save(output)
    } else {
        canvas.save(output)
    };
    result.map_err(|source| CoreError::Image {
        path: output.display().to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use image::Rgba;

    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
    const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

    /// An 8x8 still with only the pixels of `left_half` (or the right half)
    /// painted in `color`.
    fn half_still(left_half: bool, color: Rgba<u8>) -> RgbaImage {
        RgbaImage::from_fn(8, 8, |x, _| {
            if (x < 4) == left_half {
                color
            } else {
                CLEAR
            }
        })
    }

    fn halves() -> [Region; 2] {
        [Region::new(0.0, 0.0, 0.5, 1.0), Region::new(0.5, 0.0, 1.0, 1.0)]
    }

    fn write(dir: &Path, name: &str, img: &RgbaImage) -> PathBuf {
        let path = dir.join(name);
        img.save(&path).expect("write test still");
        path
    }

    #[test]
    fn single_artifact_is_reproduced_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        // Partially transparent pixels with colour must survive untouched.
        let still = RgbaImage::from_fn(5, 3, |x, y| Rgba([x as u8 * 40, y as u8 * 70, 9, (x * 50) as u8]));
        let path = write(dir.path(), "shot-0.0-0.0-1.0-1.0.png", &still);

        let canvas = composite(&[path]).unwrap();
        assert_eq!(canvas, still);
    }

    #[test]
    fn non_overlapping_artifacts_are_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let left = write(dir.path(), "a.png", &half_still(true, RED));
        let right = write(dir.path(), "b.png", &half_still(false, BLUE));

        let forward = composite(&[left.clone(), right.clone()]).unwrap();
        let backward = composite(&[right, left]).unwrap();

        assert_eq!(forward, backward);
        assert_eq!(*forward.get_pixel(0, 0), RED);
        assert_eq!(*forward.get_pixel(7, 7), BLUE);
    }

    #[test]
    fn canvas_grows_to_largest_layer() {
        let dir = tempfile::tempdir().unwrap();
        let small = write(dir.path(), "a.png", &RgbaImage::from_pixel(2, 2, RED));
        let large = write(dir.path(), "b.png", &RgbaImage::from_pixel(4, 3, CLEAR));

        let canvas = composite(&[small, large]).unwrap();
        assert_eq!(canvas.dimensions(), (4, 3));
        assert_eq!(*canvas.get_pixel(1, 1), RED);
        assert_eq!(*canvas.get_pixel(3, 2), CLEAR);
    }

    #[test]
    fn list_only_returns_this_scenes_artifacts_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let still = RgbaImage::from_pixel(1, 1, RED);
        let b = artifact_name("shot", &Region::new(0.5, 0.0, 1.0, 1.0));
        let a = artifact_name("shot", &Region::new(0.0, 0.0, 0.5, 1.0));
        write(dir.path(), &b, &still);
        write(dir.path(), &a, &still);
        write(dir.path(), "other-0.0-0.0-1.0-1.0.png", &still);
        write(dir.path(), "shot.png", &still);

        let listed = list_artifacts(dir.path(), "shot").unwrap();
        let names: Vec<String> = listed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![a, b]);
    }

    #[test]
    fn composite_dir_writes_output_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "shot-0.0-0.0-0.5-1.0.png", &half_still(true, RED));
        write(dir.path(), "shot-0.5-0.0-1.0-1.0.png", &half_still(false, BLUE));
        let output = dir.path().join("final.png");

        let report = composite_dir(dir.path(), "shot", &halves(), &output, true).unwrap();

        assert_eq!(report.layers, 2);
        assert_eq!(report.missing, 0);
        assert_eq!(report.removed, 2);
        assert_eq!((report.width, report.height), (8, 8));
        assert!(list_artifacts(dir.path(), "shot").unwrap().is_empty());

        let written = image::open(&output).unwrap().into_rgba8();
        assert_eq!(*written.get_pixel(1, 1), RED);
        assert_eq!(*written.get_pixel(6, 1), BLUE);
    }

    #[test]
    fn composite_dir_keeps_artifacts_without_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "shot-0.0-0.0-1.0-1.0.png", &half_still(true, RED));
        let output = dir.path().join("final.png");
        let whole = [Region::new(0.0, 0.0, 1.0, 1.0)];

        let report = composite_dir(dir.path(), "shot", &whole, &output, false).unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(list_artifacts(dir.path(), "shot").unwrap().len(), 1);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("final.png");
        assert_matches!(
            composite_dir(dir.path(), "shot", &halves(), &output, false),
            Err(CoreError::NoArtifacts(_))
        );
    }

    #[test]
    fn stills_from_other_runs_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "shot-0.0-0.0-0.5-1.0.png", &half_still(true, BLUE));
        // Left over from a run with a different tile size.
        write(dir.path(), "shot-0.9-0.9-1.0-1.0.png", &RgbaImage::from_pixel(8, 8, RED));
        let output = dir.path().join("final.png");

        let report = composite_dir(dir.path(), "shot", &halves(), &output, true).unwrap();

        assert_eq!(report.layers, 1);
        assert_eq!(report.missing, 1);
        let written = image::open(&output).unwrap().into_rgba8();
        assert_eq!(*written.get_pixel(1, 1), BLUE);
        assert_eq!(*written.get_pixel(6, 1), CLEAR);
        // Cleanup only touches this run's artifacts.
        assert!(dir.path().join("shot-0.9-0.9-1.0-1.0.png").is_file());
    }

    #[test]
    fn clear_artifacts_removes_only_the_scenes_stills() {
        let dir = tempfile::tempdir().unwrap();
        let still = RgbaImage::from_pixel(1, 1, RED);
        write(dir.path(), "shot-0.0-0.0-1.0-1.0.png", &still);
        write(dir.path(), "shot-0.9-0.9-1.0-1.0.png", &still);
        write(dir.path(), "other-0.0-0.0-1.0-1.0.png", &still);

        assert_eq!(clear_artifacts(dir.path(), "shot").unwrap(), 2);
        assert!(list_artifacts(dir.path(), "shot").unwrap().is_empty());
        assert_eq!(list_artifacts(dir.path(), "other").unwrap().len(), 1);
        assert_eq!(clear_artifacts(&dir.path().join("absent"), "shot").unwrap(), 0);
    }
}
