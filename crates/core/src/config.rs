//! Run configuration loaded from the environment.
//!
//! Every option has a `TILEFARM_` prefixed variable. [`RenderConfig::from_env`]
//! reads the process environment; [`RenderConfig::from_lookup`] takes any
//! lookup function so tests never touch global state.

use std::path::PathBuf;

use crate::error::CoreError;
use crate::region::validate_tile_percent;
use crate::types::is_local_node;

/// Default tile size: four regions.
pub const DEFAULT_REGION_PERCENT: u32 = 50;

/// Default working directory on each remote node, relative to its home.
pub const DEFAULT_WORKDIR: &str = "tilefarm";

/// Default local renderer executable.
pub const DEFAULT_RENDERER: &str = "blender";

/// Runtime libraries the renderer distribution needs on a bare node.
pub const DEFAULT_PACKAGES: &[&str] = &[
    "libxi6",
    "libxxf86vm1",
    "libxfixes3",
    "libxrender1",
    "libxkbcommon0",
    "libsm6",
    "libgl1",
];

/// Web mirror that nodes can fetch staged files from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    /// Base URL the mirror directory is served under.
    pub url: String,
    /// Local directory backing `url`.
    pub path: PathBuf,
}

impl MirrorConfig {
    /// URL of a file published into the mirror under `file_name`.
    pub fn file_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), file_name)
    }
}

/// Options for one distributed render run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderConfig {
    /// Worker hostnames; `master` renders locally.
    pub nodes: Vec<String>,
    /// Jump host used to reach the nodes.
    pub proxy: Option<String>,
    /// Private key for SSH authentication.
    pub key: Option<PathBuf>,
    /// Download URL of the renderer distributable.
    pub url: Option<String>,
    /// Tile size in percent of each axis (`1..=100`).
    pub region: u32,
    /// Transfer every staged file even when the remote copy is current.
    pub overwrite: bool,
    /// Report full command lines instead of summaries.
    pub verbose: bool,
    /// Log file; `None` logs to stderr.
    pub log: Option<PathBuf>,
    pub web: Option<MirrorConfig>,
    /// Delete per-region artifacts after a successful composite.
    pub cleanup: bool,
    /// Working directory on remote nodes.
    pub workdir: String,
    /// Renderer executable used by the local node.
    pub renderer: String,
    /// System packages installed while provisioning a node.
    pub packages: Vec<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            nodes: vec![crate::types::LOCAL_NODE.to_string()],
            proxy: None,
            key: None,
            url: None,
            region: DEFAULT_REGION_PERCENT,
            overwrite: false,
            verbose: false,
            log: None,
            web: None,
            cleanup: false,
            workdir: DEFAULT_WORKDIR.to_string(),
            renderer: DEFAULT_RENDERER.to_string(),
            packages: DEFAULT_PACKAGES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl RenderConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var              | Default                 |
    /// |----------------------|-------------------------|
    /// | `TILEFARM_NODES`     | `master`                |
    /// | `TILEFARM_PROXY`     | --                      |
    /// | `TILEFARM_KEY`       | --                      |
    /// | `TILEFARM_URL`       | -- (required for remote nodes) |
    /// | `TILEFARM_REGION`    | `50`                    |
    /// | `TILEFARM_OVERWRITE` | `false`                 |
    /// | `TILEFARM_VERBOSE`   | `false`                 |
    /// | `TILEFARM_LOG`       | -- (stderr)             |
    /// | `TILEFARM_WEB_URL`   | --                      |
    /// | `TILEFARM_WEB_PATH`  | --                      |
    /// | `TILEFARM_CLEANUP`   | `false`                 |
    /// | `TILEFARM_WORKDIR`   | `tilefarm`              |
    /// | `TILEFARM_RENDERER`  | `blender`               |
    /// | `TILEFARM_PACKAGES`  | renderer runtime libraries |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let nodes = get("TILEFARM_NODES")
            .map(|v| split_list(&v))
            .unwrap_or(defaults.nodes);

        let region = match get("TILEFARM_REGION") {
            Some(v) => v.parse().map_err(|_| {
                CoreError::Validation(format!("TILEFARM_REGION must be an integer, got '{v}'"))
            })?,
            None => defaults.region,
        };

        let web = match (get("TILEFARM_WEB_URL"), get("TILEFARM_WEB_PATH")) {
            (Some(url), Some(path)) => Some(MirrorConfig {
                url,
                path: PathBuf::from(path),
            }),
            (None, None) => None,
            _ => {
                return Err(CoreError::Validation(
                    "TILEFARM_WEB_URL and TILEFARM_WEB_PATH must be set together".to_string(),
                ))
            }
        };

        let config = Self {
            nodes,
            proxy: get("TILEFARM_PROXY"),
            key: get("TILEFARM_KEY").map(PathBuf::from),
            url: get("TILEFARM_URL"),
            region,
            overwrite: parse_flag("TILEFARM_OVERWRITE", get("TILEFARM_OVERWRITE"))?,
            verbose: parse_flag("TILEFARM_VERBOSE", get("TILEFARM_VERBOSE"))?,
            log: get("TILEFARM_LOG").map(PathBuf::from),
            web,
            cleanup: parse_flag("TILEFARM_CLEANUP", get("TILEFARM_CLEANUP"))?,
            workdir: get("TILEFARM_WORKDIR").unwrap_or(defaults.workdir),
            renderer: get("TILEFARM_RENDERER").unwrap_or(defaults.renderer),
            packages: get("TILEFARM_PACKAGES")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.packages),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field rules that a single variable cannot express.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_tile_percent(self.region)?;

        if self.nodes.is_empty() {
            return Err(CoreError::Validation(
                "At least one node must be configured".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            validate_node_name(node)?;
            if !seen.insert(node.as_str()) {
                return Err(CoreError::Validation(format!("Duplicate node: \"{node}\"")));
            }
        }

        if self.has_remote_nodes() {
            match &self.url {
                Some(url) => validate_http_url("TILEFARM_URL", url)?,
                None => {
                    return Err(CoreError::Validation(
                        "TILEFARM_URL is required when remote nodes are configured".to_string(),
                    ))
                }
            }
        }

        if let Some(web) = &self.web {
            validate_http_url("TILEFARM_WEB_URL", &web.url)?;
        }

        if self.workdir.is_empty() || self.workdir.contains(char::is_whitespace) {
            return Err(CoreError::Validation(format!(
                "TILEFARM_WORKDIR must be a non-empty path without whitespace, got '{}'",
                self.workdir
            )));
        }

        Ok(())
    }

    /// Whether any configured node needs a remote session.
    pub fn has_remote_nodes(&self) -> bool {
        self.nodes.iter().any(|n| !is_local_node(n))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_flag(name: &str, value: Option<String>) -> Result<bool, CoreError> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CoreError::Validation(format!(
            "{name} must be a boolean, got '{value}'"
        ))),
    }
}

/// Node names end up in `ssh` arguments, so only `[user@]host` shapes pass.
fn validate_node_name(node: &str) -> Result<(), CoreError> {
    let valid = !node.is_empty()
        && node.len() <= 255
        && !node.starts_with('-')
        && node.matches('@').count() <= 1
        && node
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if !valid {
        return Err(CoreError::Validation(format!(
            "Invalid node name: \"{node}\""
        )));
    }
    Ok(())
}

fn validate_http_url(name: &str, url: &str) -> Result<(), CoreError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(CoreError::Validation(format!(
            "{name} must start with http:// or https://, got: '{url}'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<RenderConfig, CoreError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RenderConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn empty_environment_renders_locally() {
        let config = load(&[]).unwrap();
        assert_eq!(config, RenderConfig::default());
        assert_eq!(config.nodes, vec!["master"]);
        assert!(!config.has_remote_nodes());
    }

    #[test]
    fn full_environment_is_parsed() {
        let config = load(&[
            ("TILEFARM_NODES", "gpu1, ubuntu@gpu2,master"),
            ("TILEFARM_PROXY", "bastion.example.com"),
            ("TILEFARM_KEY", "/home/me/.ssh/farm"),
            ("TILEFARM_URL", "https://download.example.com/blender.tar.xz"),
            ("TILEFARM_REGION", "25"),
            ("TILEFARM_OVERWRITE", "yes"),
            ("TILEFARM_VERBOSE", "1"),
            ("TILEFARM_LOG", "/tmp/farm.log"),
            ("TILEFARM_WEB_URL", "http://files.example.com/farm/"),
            ("TILEFARM_WEB_PATH", "/srv/www/farm"),
            ("TILEFARM_CLEANUP", "on"),
            ("TILEFARM_WORKDIR", "render"),
            ("TILEFARM_PACKAGES", "libgl1,libsm6"),
        ])
        .unwrap();

        assert_eq!(config.nodes, vec!["gpu1", "ubuntu@gpu2", "master"]);
        assert_eq!(config.proxy.as_deref(), Some("bastion.example.com"));
        assert_eq!(config.key, Some(PathBuf::from("/home/me/.ssh/farm")));
        assert_eq!(config.region, 25);
        assert!(config.overwrite && config.verbose && config.cleanup);
        assert_eq!(config.log, Some(PathBuf::from("/tmp/farm.log")));
        assert_eq!(config.workdir, "render");
        assert_eq!(config.packages, vec!["libgl1", "libsm6"]);
        let web = config.web.unwrap();
        assert_eq!(web.file_url("shot.blend"), "http://files.example.com/farm/shot.blend");
    }

    #[test]
    fn remote_nodes_require_a_download_url() {
        assert_matches!(
            load(&[("TILEFARM_NODES", "gpu1")]),
            Err(CoreError::Validation(msg)) if msg.contains("TILEFARM_URL")
        );
        assert_matches!(
            load(&[("TILEFARM_NODES", "gpu1"), ("TILEFARM_URL", "ftp://x/y.tar.xz")]),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn region_must_be_in_range_and_numeric() {
        assert!(load(&[("TILEFARM_REGION", "0")]).is_err());
        assert!(load(&[("TILEFARM_REGION", "101")]).is_err());
        assert!(load(&[("TILEFARM_REGION", "ten")]).is_err());
        assert_eq!(load(&[("TILEFARM_REGION", "100")]).unwrap().region, 100);
    }

    #[test]
    fn mirror_needs_both_url_and_path() {
        assert!(load(&[("TILEFARM_WEB_URL", "http://x")]).is_err());
        assert!(load(&[("TILEFARM_WEB_PATH", "/srv")]).is_err());
    }

    #[test]
    fn bad_flags_are_rejected() {
        assert_matches!(
            load(&[("TILEFARM_VERBOSE", "sometimes")]),
            Err(CoreError::Validation(msg)) if msg.contains("TILEFARM_VERBOSE")
        );
    }

    #[test]
    fn node_names_are_validated() {
        assert!(load(&[("TILEFARM_NODES", "master,master")]).is_err());
        assert!(validate_node_name("gpu-1.farm.local").is_ok());
        assert!(validate_node_name("me@gpu1").is_ok());
        assert!(validate_node_name("-oProxyCommand=evil").is_err());
        assert!(validate_node_name("gpu1; rm -rf /").is_err());
        assert!(validate_node_name("a@b@c").is_err());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("TILEFARM_NODES", "  "), ("TILEFARM_REGION", "")]).unwrap();
        assert_eq!(config.nodes, vec!["master"]);
        assert_eq!(config.region, DEFAULT_REGION_PERCENT);
    }
}
