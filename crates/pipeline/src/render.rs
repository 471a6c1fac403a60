//! Renderer invocation for one region.

use tilefarm_core::naming::artifact_name;
use tilefarm_core::region::Region;
use tilefarm_remote::shell;

/// `<renderer> -b <scene> --python-exit-code 1 -P <hook> -- <min_x> <min_y> <max_x> <max_y> <prefix>`
///
/// Paths are as seen by the node that runs the command. The hook writes the
/// still to `<prefix>-<min_x>-<min_y>-<max_x>-<max_y>.png`. An exception in
/// the hook makes the renderer exit non-zero instead of 0.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderCommand {
    pub renderer: String,
    pub scene: String,
    pub hook: String,
    /// Job directory on the node.
    pub job_dir: String,
    pub stem: String,
    pub region: Region,
}

impl RenderCommand {
    /// `<job dir>/<scene stem>`; the hook appends the region coordinates.
    pub fn prefix(&self) -> String {
        format!("{}/{}", self.job_dir.trim_end_matches('/'), self.stem)
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.renderer.clone(),
            "-b".to_string(),
            self.scene.clone(),
            "--python-exit-code".to_string(),
            "1".to_string(),
            "-P".to_string(),
            self.hook.clone(),
            "--".to_string(),
        ];
        args.extend(self.region.coord_args());
        args.push(self.prefix());
        args
    }

    /// Shell-quoted command line.
    pub fn command_line(&self) -> String {
        shell::join(self.args())
    }

    /// Where the artifact lands on the node.
    pub fn artifact_path(&self) -> String {
        format!(
            "{}/{}",
            self.job_dir.trim_end_matches('/'),
            artifact_name(&self.stem, &self.region)
        )
    }

    /// Status line shown before the render starts.
    pub fn preview(&self, verbose: bool) -> String {
        if verbose {
            self.command_line()
        } else {
            format!("rendering {} region {}", self.stem, self.region)
        }
    }
}
