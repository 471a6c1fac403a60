//! Deterministic file naming for staged scenes and rendered artifacts.
//!
//! The scripting hook writes each region to `{prefix}-{min_x}-{min_y}-{max_x}-{max_y}.png`
//! where `prefix` is the job directory joined with the scene's base name.
//! Everything that needs to find an artifact derives the name here.

use std::path::Path;

use crate::error::CoreError;
use crate::region::Region;

/// Separator between the scene base name and each region coordinate.
pub const SEPARATOR: &str = "-";

/// Extension the renderer appends to every still.
pub const ARTIFACT_EXTENSION: &str = "png";

/// Base name of the scene file without its extension (`shot.blend` -> `shot`).
pub fn scene_stem(scene: &Path) -> Result<String, CoreError> {
    scene
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "Scene path has no usable file name: {}",
                scene.display()
            ))
        })
}

/// File name of the artifact rendered for `region`.
///
/// # Examples
///
/// ```
/// use tilefarm_core::naming::artifact_name;
/// use tilefarm_core::region::Region;
///
/// let region = Region::new(0.0, 0.5, 0.5, 1.0);
/// assert_eq!(artifact_name("shot", &region), "shot-0.0-0.5-0.5-1.0.png");
/// ```
pub fn artifact_name(stem: &str, region: &Region) -> String {
    format!("{stem}{SEPARATOR}{}.{ARTIFACT_EXTENSION}", region.key())
}

/// Whether `file_name` is an artifact produced for the scene `stem`.
pub fn is_artifact_of(stem: &str, file_name: &str) -> bool {
    let Some(rest) = file_name.strip_prefix(stem) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix(SEPARATOR) else {
        return false;
    };
    let Some(coords) = rest.strip_suffix(&format!(".{ARTIFACT_EXTENSION}")) else {
        return false;
    };
    let parts: Vec<&str> = coords.split(SEPARATOR).collect();
    parts.len() == 4 && parts.iter().all(|p| p.parse::<f64>().is_ok())
}

/// Name of the local directory collecting the artifacts of one job.
pub fn artifact_dir_name(stem: &str) -> String {
    format!("{stem}{SEPARATOR}regions")
}
