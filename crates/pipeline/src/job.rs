//! Everything one render run shares across node workers.

use std::path::{Path, PathBuf};

use tilefarm_core::compositor::clear_artifacts;
use tilefarm_core::config::RenderConfig;
use tilefarm_core::naming::{artifact_dir_name, scene_stem};

use crate::error::PipelineError;
use crate::hook::HookSource;

/// Name of the optional texture directory next to the scene file.
pub const TEXTURE_DIR: &str = "textures";

#[derive(Debug, Clone)]
pub struct Job {
    /// Absolute path of the scene file.
    pub scene: PathBuf,
    /// Scene base name; names the job directory and every artifact.
    pub stem: String,
    /// Local hook script.
    pub hook: PathBuf,
    /// Local directory collecting the downloaded artifacts.
    pub artifact_dir: PathBuf,
    pub output: PathBuf,
    pub config: RenderConfig,
}

impl Job {
    /// Resolve paths and create the artifact directory next to `output`.
    ///
    /// Stills left in that directory by an earlier run of the same scene are
    /// removed first.
    pub fn prepare(
        scene: &Path,
        output: &Path,
        hook: &HookSource,
        config: RenderConfig,
    ) -> Result<Self, PipelineError> {
        let scene = scene
            .canonicalize()
            .map_err(|e| PipelineError::staging(scene, e))?;
        if !scene.is_file() {
            return Err(PipelineError::staging(&scene, "scene is not a file"));
        }
        let stem = scene_stem(&scene).map_err(|e| PipelineError::staging(&scene, e))?;

        let output_dir = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let artifact_dir = output_dir.join(artifact_dir_name(&stem));
        std::fs::create_dir_all(&artifact_dir).map_err(|e| PipelineError::staging(&artifact_dir, e))?;
        let artifact_dir = artifact_dir
            .canonicalize()
            .map_err(|e| PipelineError::staging(&artifact_dir, e))?;
        let stale = clear_artifacts(&artifact_dir, &stem).map_err(|e| PipelineError::staging(&artifact_dir, e))?;
        if stale > 0 {
            tracing::info!(dir = %artifact_dir.display(), removed = stale, "Removed stills from an earlier run");
        }

        let hook = hook.materialize(&artifact_dir)?;

        Ok(Self {
            scene,
            stem,
            hook,
            artifact_dir,
            output: output.to_path_buf(),
            config,
        })
    }

    /// Job directory on a remote node.
    pub fn remote_job_dir(&self) -> String {
        format!("{}/{}", self.config.workdir.trim_end_matches('/'), self.stem)
    }

    /// `<scene dir>/textures`, when it exists.
    pub fn texture_dir(&self) -> Option<PathBuf> {
        self.scene
            .parent()
            .map(|dir| dir.join(TEXTURE_DIR))
            .filter(|dir| dir.is_dir())
    }
}

/// File name component of `path` as UTF-8.
pub(crate) fn file_name(path: &Path) -> Result<&str, PipelineError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::staging(path, "file name is not valid UTF-8"))
}
