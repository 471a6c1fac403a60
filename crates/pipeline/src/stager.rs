//! Incremental copy of input files onto a node.
//!
//! A file is re-sent only when the node's copy is missing, differs in size,
//! or is older than the local file. With a mirror configured the node first
//! tries to fetch the file over HTTP from the mirror; a direct upload is the
//! fallback and produces the same destination file.
//!
//! The mirror directory reproduces the node-side layout (`<mirror>/<dst>`),
//! so files sharing a base name in different directories never collide.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tilefarm_core::config::MirrorConfig;
use tilefarm_remote::{shell, NodeSession};
use walkdir::WalkDir;

use crate::error::PipelineError;

/// How a file ended up on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The node's copy was already current.
    Skipped,
    /// The node fetched the file from the mirror.
    Mirrored,
    /// The file was pushed over the session.
    Uploaded,
}

/// Size and modification time (epoch seconds) of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub mtime: i64,
}

impl FileStamp {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);
        Ok(Self {
            size: meta.len(),
            mtime,
        })
    }

    /// Parse `stat -c '%s %Y'` output.
    pub fn parse(stdout: &str) -> Option<Self> {
        let mut parts = stdout.split_whitespace();
        let size = parts.next()?.parse().ok()?;
        let mtime = parts.next()?.parse().ok()?;
        Some(Self { size, mtime })
    }

    /// Whether a copy stamped `self` can stand in for `source`.
    pub fn is_current_for(&self, source: &FileStamp) -> bool {
        self.size == source.size && self.mtime >= source.mtime
    }
}

// ---------------------------------------------------------------------------
// Mirror lookup
// ---------------------------------------------------------------------------

/// Checks whether a mirror URL is reachable before a node is told to fetch it.
#[async_trait]
pub trait MirrorLookup: Send + Sync {
    async fn available(&self, url: &str) -> bool;
}

/// Checks with an HTTP `HEAD` request.
#[derive(Debug, Clone)]
pub struct HttpLookup {
    client: reqwest::Client,
}

impl HttpLookup {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MirrorLookup for HttpLookup {
    async fn available(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url, error = %e, "Mirror lookup failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

/// Web mirror shared by every node worker of a run.
///
/// Publishing is serialised and atomic (copy to a hidden partial file, then
/// rename), so a node never fetches a half-written file.
pub struct Mirror {
    config: MirrorConfig,
    lookup: Arc<dyn MirrorLookup>,
    publish_lock: Mutex<()>,
}

impl Mirror {
    pub fn new(config: MirrorConfig, lookup: Arc<dyn MirrorLookup>) -> Self {
        Self {
            config,
            lookup,
            publish_lock: Mutex::new(()),
        }
    }

    /// Local file backing the mirror copy of node path `dst`.
    pub fn published_path(&self, dst: &str) -> PathBuf {
        mirror_segments(dst).fold(self.config.path.clone(), |path, part| path.join(part))
    }

    /// URL the node fetches `dst` from.
    pub fn url(&self, dst: &str) -> String {
        let encoded: Vec<String> = mirror_segments(dst).map(encode_segment).collect();
        self.config.file_url(&encoded.join("/"))
    }

    /// Make the mirror copy of `dst` current with the local file `src`.
    async fn publish(&self, src: &Path, local: &FileStamp, dst: &str) -> Result<(), PipelineError> {
        let _guard = self.publish_lock.lock().await;
        let published = self.published_path(dst);
        if FileStamp::of(&published).is_ok_and(|p| p.is_current_for(local)) {
            return Ok(());
        }

        let (Some(dir), Some(name)) = (published.parent(), published.file_name()) else {
            return Err(PipelineError::staging(&published, "not a file path"));
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PipelineError::staging(dir, e))?;

        let partial = dir.join(format!(".{}.partial", name.to_string_lossy()));
        tokio::fs::copy(src, &partial)
            .await
            .map_err(|e| PipelineError::staging(&partial, e))?;
        tokio::fs::rename(&partial, &published)
            .await
            .map_err(|e| PipelineError::staging(&published, e))?;
        tracing::debug!(published = %published.display(), "Published to mirror");
        Ok(())
    }
}

/// Path components of `dst` usable below the mirror root.
fn mirror_segments(dst: &str) -> impl Iterator<Item = &str> {
    dst.split('/').filter(|part| !part.is_empty() && *part != "." && *part != "..")
}

/// Percent-encode everything outside the URL unreserved set.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// FileStager
// ---------------------------------------------------------------------------

pub struct FileStager {
    session: Arc<dyn NodeSession>,
    overwrite: bool,
    mirror: Option<Arc<Mirror>>,
}

impl FileStager {
    pub fn new(session: Arc<dyn NodeSession>, overwrite: bool) -> Self {
        Self {
            session,
            overwrite,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Option<Arc<Mirror>>) -> Self {
        self.mirror = mirror;
        self
    }

    /// Make `dst` on the node a current copy of the local file `src`.
    ///
    /// The parent directory of `dst` must already exist on the node.
    pub async fn copy(&self, src: &Path, dst: &str) -> Result<StageOutcome, PipelineError> {
        let local = FileStamp::of(src).map_err(|e| PipelineError::staging(src, e))?;

        if !self.overwrite {
            if let Some(remote) = self.remote_stamp(dst).await {
                if remote.is_current_for(&local) {
                    tracing::debug!(node = self.session.node(), dst, "Remote copy current, skipping");
                    return Ok(StageOutcome::Skipped);
                }
            }
        }

        if let Some(mirror) = &self.mirror {
            match self.fetch_from_mirror(mirror, src, &local, dst).await {
                Ok(true) => return Ok(StageOutcome::Mirrored),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        node = self.session.node(),
                        dst,
                        error = %e,
                        "Mirror fetch failed, uploading directly",
                    );
                }
            }
        }

        self.session.upload(src, dst).await?;
        Ok(StageOutcome::Uploaded)
    }

    /// Copy every file below `src_dir` into `dst_dir`, keeping relative paths.
    pub async fn copy_tree(&self, src_dir: &Path, dst_dir: &str) -> Result<Vec<StageOutcome>, PipelineError> {
        let mut dirs = vec![dst_dir.to_string()];
        let mut files = Vec::new();

        for entry in WalkDir::new(src_dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| PipelineError::staging(src_dir, e))?;
            let rel = entry
                .path()
                .strip_prefix(src_dir)
                .map_err(|e| PipelineError::staging(entry.path(), e))?;
            let remote = remote_join(dst_dir, rel);
            if entry.file_type().is_dir() {
                dirs.push(remote);
            } else if entry.file_type().is_file() {
                files.push((entry.into_path(), remote));
            }
        }

        self.make_dirs(&dirs).await?;

        let mut outcomes = Vec::with_capacity(files.len());
        for (local, remote) in files {
            outcomes.push(self.copy(&local, &remote).await?);
        }
        Ok(outcomes)
    }

    /// `mkdir -p` every directory in one command.
    pub async fn make_dirs(&self, dirs: &[String]) -> Result<(), PipelineError> {
        let command = format!("mkdir -p {}", shell::join(dirs));
        let output = self.session.exec(&command).await?;
        if !output.success() {
            return Err(PipelineError::Command {
                node: self.session.node().to_string(),
                exit_code: output.exit_code,
                detail: output.summary(),
            });
        }
        Ok(())
    }

    /// `None` when the node has no readable copy or cannot be asked.
    async fn remote_stamp(&self, dst: &str) -> Option<FileStamp> {
        let command = format!("stat -c '%s %Y' {}", shell::quote(dst));
        match self.session.exec(&command).await {
            Ok(output) if output.success() => FileStamp::parse(&output.stdout),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(node = self.session.node(), dst, error = %e, "Remote stat failed");
                None
            }
        }
    }

    /// Publish `src` into the mirror and have the node fetch it.
    ///
    /// `Ok(false)` means the mirror does not serve the file. The fetched
    /// copy is checked against the local size before it counts.
    async fn fetch_from_mirror(
        &self,
        mirror: &Mirror,
        src: &Path,
        local: &FileStamp,
        dst: &str,
    ) -> Result<bool, PipelineError> {
        mirror.publish(src, local, dst).await?;

        let url = mirror.url(dst);
        if !mirror.lookup.available(&url).await {
            tracing::debug!(url, "Mirror does not serve file");
            return Ok(false);
        }

        // -R keeps the server's Last-Modified so later stat checks see a current copy.
        let command = format!("curl -fsSLR -o {} {}", shell::quote(dst), shell::quote(&url));
        let output = self.session.exec(&command).await?;
        if !output.success() {
            return Err(PipelineError::Command {
                node: self.session.node().to_string(),
                exit_code: output.exit_code,
                detail: output.summary(),
            });
        }

        match self.remote_stamp(dst).await {
            Some(fetched) if fetched.size == local.size => Ok(true),
            fetched => Err(PipelineError::Staging {
                path: dst.to_string(),
                reason: format!(
                    "mirror copy has {} bytes, expected {}",
                    fetched.map_or_else(|| "no".to_string(), |f| f.size.to_string()),
                    local.size
                ),
            }),
        }
    }
}

/// Join a relative local path onto a remote directory with `/` separators.
fn remote_join(base: &str, rel: &Path) -> String {
    let mut joined = base.trim_end_matches('/').to_string();
    for part in rel.components() {
        joined.push('/');
        joined.push_str(&part.as_os_str().to_string_lossy());
    }
    joined
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use tilefarm_remote::mock::MockSession;
    use tilefarm_remote::CommandOutput;

    use super::*;

    struct FixedLookup {
        up: bool,
        calls: AtomicUsize,
    }

    impl FixedLookup {
        fn new(up: bool) -> Arc<Self> {
            Arc::new(Self {
                up,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MirrorLookup for FixedLookup {
        async fn available(&self, _url: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.up
        }
    }

    fn scene_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("shot.blend");
        std::fs::write(&path, b"BLENDER-v300").unwrap();
        path
    }

    #[test]
    fn stamp_parsing_and_currency() {
        let stamp = FileStamp::parse("12 1700000000\n").unwrap();
        assert_eq!(stamp, FileStamp { size: 12, mtime: 1_700_000_000 });
        assert!(FileStamp::parse("garbage").is_none());

        let local = FileStamp { size: 12, mtime: 100 };
        assert!(FileStamp { size: 12, mtime: 100 }.is_current_for(&local));
        assert!(FileStamp { size: 12, mtime: 101 }.is_current_for(&local));
        assert!(!FileStamp { size: 12, mtime: 99 }.is_current_for(&local));
        assert!(!FileStamp { size: 13, mtime: 200 }.is_current_for(&local));
    }

    #[tokio::test]
    async fn second_copy_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let src = scene_file(dir.path());
        let session = Arc::new(MockSession::new("gpu1"));
        let stager = FileStager::new(session.clone(), false);

        assert_eq!(stager.copy(&src, "tilefarm/shot/shot.blend").await.unwrap(), StageOutcome::Uploaded);
        assert_eq!(stager.copy(&src, "tilefarm/shot/shot.blend").await.unwrap(), StageOutcome::Skipped);
        assert_eq!(session.uploads().len(), 1);
    }

    #[tokio::test]
    async fn overwrite_forces_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let src = scene_file(dir.path());
        let session = Arc::new(MockSession::new("gpu1"));
        let stager = FileStager::new(session.clone(), true);

        stager.copy(&src, "job/shot.blend").await.unwrap();
        assert_eq!(stager.copy(&src, "job/shot.blend").await.unwrap(), StageOutcome::Uploaded);
        assert_eq!(session.uploads().len(), 2);
        assert!(session.commands_starting_with("stat ").is_empty());
    }

    #[tokio::test]
    async fn stale_or_resized_remote_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let src = scene_file(dir.path());
        let local = FileStamp::of(&src).unwrap();

        let older = Arc::new(MockSession::new("a").with_file("job/shot.blend", local.size, local.mtime - 10));
        let outcome = FileStager::new(older.clone(), false).copy(&src, "job/shot.blend").await.unwrap();
        assert_eq!(outcome, StageOutcome::Uploaded);

        let resized = Arc::new(MockSession::new("b").with_file("job/shot.blend", local.size + 1, local.mtime + 10));
        let outcome = FileStager::new(resized, false).copy(&src, "job/shot.blend").await.unwrap();
        assert_eq!(outcome, StageOutcome::Uploaded);

        let newer = Arc::new(MockSession::new("c").with_file("job/shot.blend", local.size, local.mtime + 10));
        let outcome = FileStager::new(newer, false).copy(&src, "job/shot.blend").await.unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);
    }

    fn mirror(dir: &Path, up: bool) -> (Arc<Mirror>, Arc<FixedLookup>) {
        let lookup = FixedLookup::new(up);
        let config = MirrorConfig {
            url: "http://mirror.local/files".to_string(),
            path: dir.join("www"),
        };
        (Arc::new(Mirror::new(config, lookup.clone())), lookup)
    }

    #[test]
    fn mirror_layout_follows_node_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (mirror, _) = mirror(dir.path(), true);

        assert_eq!(
            mirror.published_path("/srv/tilefarm/shot/textures/a/wood.png"),
            dir.path().join("www/srv/tilefarm/shot/textures/a/wood.png")
        );
        assert_eq!(
            mirror.url("tilefarm/my shot/../x#1.png"),
            "http://mirror.local/files/tilefarm/my%20shot/x%231.png"
        );
    }

    #[tokio::test]
    async fn mirror_fetch_is_preferred_when_served() {
        let dir = tempfile::tempdir().unwrap();
        let src = scene_file(dir.path());
        let local = FileStamp::of(&src).unwrap();
        let (mirror, lookup) = mirror(dir.path(), true);
        let session = Arc::new(MockSession::new("gpu1").creates_file(
            "curl ",
            "job/shot.blend",
            local.size,
            local.mtime,
        ));
        let stager = FileStager::new(session.clone(), false).with_mirror(Some(mirror));

        let outcome = stager.copy(&src, "job/shot.blend").await.unwrap();
        assert_eq!(outcome, StageOutcome::Mirrored);
        assert_eq!(std::fs::read(dir.path().join("www/job/shot.blend")).unwrap(), b"BLENDER-v300");
        assert!(session.uploads().is_empty());

        let curl = session.commands_starting_with("curl ");
        assert_eq!(curl, vec!["curl -fsSLR -o job/shot.blend http://mirror.local/files/job/shot.blend"]);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        // The fetched copy is current, so a second pass skips it.
        assert_eq!(stager.copy(&src, "job/shot.blend").await.unwrap(), StageOutcome::Skipped);
    }

    #[tokio::test]
    async fn mirror_failure_falls_back_to_upload() {
        let dir = tempfile::tempdir().unwrap();
        let src = scene_file(dir.path());

        // Mirror does not serve the file.
        let session = Arc::new(MockSession::new("a"));
        let stager = FileStager::new(session.clone(), false).with_mirror(Some(mirror(dir.path(), false).0));
        assert_eq!(stager.copy(&src, "job/shot.blend").await.unwrap(), StageOutcome::Uploaded);
        assert!(session.commands_starting_with("curl ").is_empty());

        // Served, but the node cannot fetch.
        let session = Arc::new(MockSession::new("b").respond("curl ", CommandOutput::with_exit(22, "")));
        let stager = FileStager::new(session.clone(), false).with_mirror(Some(mirror(dir.path(), true).0));
        assert_eq!(stager.copy(&src, "job/shot.blend").await.unwrap(), StageOutcome::Uploaded);
        assert_eq!(session.uploads().len(), 1);
    }

    #[tokio::test]
    async fn truncated_mirror_fetch_falls_back_to_upload() {
        let dir = tempfile::tempdir().unwrap();
        let src = scene_file(dir.path());
        let local = FileStamp::of(&src).unwrap();
        // curl exits 0 but leaves a short file.
        let session = Arc::new(MockSession::new("gpu1").creates_file(
            "curl ",
            "job/shot.blend",
            local.size - 4,
            local.mtime,
        ));
        let stager = FileStager::new(session.clone(), false).with_mirror(Some(mirror(dir.path(), true).0));

        assert_eq!(stager.copy(&src, "job/shot.blend").await.unwrap(), StageOutcome::Uploaded);
        assert_eq!(session.file("job/shot.blend").unwrap().size, local.size);
    }

    #[tokio::test]
    async fn concurrent_nodes_share_one_complete_mirror_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("shot.blend");
        std::fs::write(&src, vec![7u8; 256 * 1024]).unwrap();
        let local = FileStamp::of(&src).unwrap();
        let (mirror, _) = mirror(dir.path(), true);

        let stagers: Vec<_> = ["gpu1", "gpu2", "gpu3", "gpu4"]
            .into_iter()
            .map(|node| {
                let session = Arc::new(MockSession::new(node).creates_file(
                    "curl ",
                    "tilefarm/shot/shot.blend",
                    local.size,
                    local.mtime,
                ));
                FileStager::new(session, false).with_mirror(Some(Arc::clone(&mirror)))
            })
            .collect();

        let outcomes =
            futures::future::join_all(stagers.iter().map(|s| s.copy(&src, "tilefarm/shot/shot.blend"))).await;

        for outcome in outcomes {
            assert_eq!(outcome.unwrap(), StageOutcome::Mirrored);
        }
        let published = dir.path().join("www/tilefarm/shot/shot.blend");
        assert_eq!(std::fs::read(&published).unwrap(), std::fs::read(&src).unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(published.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn same_base_name_in_different_directories_stays_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let textures = dir.path().join("textures");
        std::fs::create_dir_all(textures.join("a")).unwrap();
        std::fs::create_dir_all(textures.join("b")).unwrap();
        std::fs::write(textures.join("a/wood.png"), b"oak").unwrap();
        std::fs::write(textures.join("b/wood.png"), b"walnut").unwrap();

        let session = Arc::new(MockSession::new("gpu1"));
        FileStager::new(session, false)
            .with_mirror(Some(mirror(dir.path(), false).0))
            .copy_tree(&textures, "tilefarm/shot/textures")
            .await
            .unwrap();

        let www = dir.path().join("www/tilefarm/shot/textures");
        assert_eq!(std::fs::read(www.join("a/wood.png")).unwrap(), b"oak");
        assert_eq!(std::fs::read(www.join("b/wood.png")).unwrap(), b"walnut");
    }

    #[tokio::test]
    async fn broken_stat_forces_a_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let src = scene_file(dir.path());
        let local = FileStamp::of(&src).unwrap();
        let session = Arc::new(
            MockSession::new("gpu1")
                .with_file("job/shot.blend", local.size, local.mtime)
                .exec_error("stat "),
        );

        let outcome = FileStager::new(session.clone(), false).copy(&src, "job/shot.blend").await.unwrap();
        assert_eq!(outcome, StageOutcome::Uploaded);
    }

    #[tokio::test]
    async fn failed_upload_is_a_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = scene_file(dir.path());
        let session = Arc::new(MockSession::new("gpu1"));
        session.fail_uploads(true);

        let err = FileStager::new(session, false).copy(&src, "job/shot.blend").await.unwrap_err();
        assert_matches!(err, PipelineError::Transfer(_));
    }

    #[tokio::test]
    async fn missing_local_file_is_a_staging_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(MockSession::new("gpu1"));
        let err = FileStager::new(session, false)
            .copy(&dir.path().join("absent.blend"), "job/absent.blend")
            .await
            .unwrap_err();
        assert_matches!(err, PipelineError::Staging { .. });
    }

    #[tokio::test]
    async fn tree_copy_creates_directories_and_keeps_layout() {
        let dir = tempfile::tempdir().unwrap();
        let textures = dir.path().join("textures");
        std::fs::create_dir_all(textures.join("wood")).unwrap();
        std::fs::write(textures.join("sky.png"), b"sky").unwrap();
        std::fs::write(textures.join("wood/oak.png"), b"oak").unwrap();

        let session = Arc::new(MockSession::new("gpu1"));
        let outcomes = FileStager::new(session.clone(), false)
            .copy_tree(&textures, "tilefarm/shot/textures")
            .await
            .unwrap();

        assert_eq!(outcomes, vec![StageOutcome::Uploaded, StageOutcome::Uploaded]);
        assert_eq!(
            session.commands_starting_with("mkdir "),
            vec!["mkdir -p tilefarm/shot/textures tilefarm/shot/textures/wood"]
        );
        let mut remote: Vec<String> = session.uploads().into_iter().map(|(_, r)| r).collect();
        remote.sort();
        assert_eq!(remote, vec!["tilefarm/shot/textures/sky.png", "tilefarm/shot/textures/wood/oak.png"]);
    }

    #[test]
    fn remote_join_uses_forward_slashes() {
        assert_eq!(remote_join("a/b/", Path::new("c/d.png")), "a/b/c/d.png");
    }
}
