//! The renderer scripting hook run for every region.

use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Hook shipped with the binary.
pub const BUILTIN_HOOK: &str = include_str!("../assets/render_region.py");

/// File name the built-in hook is written under.
pub const BUILTIN_HOOK_NAME: &str = "render_region.py";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HookSource {
    #[default]
    Builtin,
    File(PathBuf),
}

impl HookSource {
    pub fn from_option(path: Option<PathBuf>) -> Self {
        path.map_or(Self::Builtin, Self::File)
    }

    /// Local path of the hook, writing the built-in one into `dir` if needed.
    pub fn materialize(&self, dir: &Path) -> Result<PathBuf, PipelineError> {
        match self {
            Self::File(path) => {
                if !path.is_file() {
                    return Err(PipelineError::staging(path, "hook script not found"));
                }
                Ok(path.clone())
            }
            Self::Builtin => {
                std::fs::create_dir_all(dir).map_err(|e| PipelineError::staging(dir, e))?;
                let path = dir.join(BUILTIN_HOOK_NAME);
                std::fs::write(&path, BUILTIN_HOOK).map_err(|e| PipelineError::staging(&path, e))?;
                Ok(path)
            }
        }
    }
}
