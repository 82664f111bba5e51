use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::MirrorError;
use crate::naming::AssetDir;

/// Characters stripped from titles before they become directory names.
const ILLEGAL_TITLE_CHARS: &[char] = &[
    '~', '#', '%', '&', '*', '{', '}', ':', '<', '>', '?', '|', '"', '-', '/', '\\',
];

/// Turns a page title into a single filesystem-safe path segment.
pub fn sanitize_title(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if ILLEGAL_TITLE_CHARS.contains(&c) || c.is_control() {
                ' '
            } else {
                c
            }
        })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches('.').trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The on-disk skeleton of one mirrored page:
/// `<root>/{resources/, img/, css/, js/, <title>.html}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLayout {
    root: PathBuf,
    title: String,
}

impl PageLayout {
    pub fn new(parent: &Path, title: &str) -> Self {
        Self {
            root: parent.join(title),
            title: title.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn dir(&self, dir: AssetDir) -> PathBuf {
        self.root.join(dir.as_str())
    }

    pub fn html_path(&self) -> PathBuf {
        self.root.join(format!("{}.html", self.title))
    }

    pub fn raw_path(&self) -> PathBuf {
        self.dir(AssetDir::Resources).join("index_raw.html")
    }

    /// Path of `path` relative to this page's HTML file, with `/` separators.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let relative = pathdiff::diff_paths(path, &self.root)?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| match c {
                Component::ParentDir => Some("..".to_string()),
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Option<_>>()?;
        Some(segments.join("/"))
    }

    async fn create_skeleton(&self) -> Result<()> {
        for dir in AssetDir::ALL {
            let path = self.dir(dir);
            fs::create_dir_all(&path)
                .await
                .with_context(|| format!("Failed to create directory: {:?}", path))?;
        }
        Ok(())
    }
}

type ClaimKey = (PathBuf, String);
type Claim = Arc<OnceCell<Option<String>>>;

/// Owns every write under the output directory.
pub struct FileManager {
    base_dir: PathBuf,
    write_retry: RetryPolicy,
    claims: Mutex<HashMap<ClaimKey, Claim>>,
}

impl FileManager {
    pub fn new(base_dir: &Path, write_retry: RetryPolicy) -> Result<Self> {
        let base_dir = base_dir.to_path_buf();
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create base directory: {:?}", base_dir))?;

        Ok(Self {
            base_dir,
            write_retry,
            claims: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Skeleton for a course page; any previous copy is deleted first.
    pub async fn prepare_fresh(&self, title: &str) -> Result<PageLayout> {
        let layout = PageLayout::new(&self.base_dir, title);
        if fs::try_exists(layout.root()).await.unwrap_or(false) {
            info!(path = %layout.root().display(), "Course folder already found, recreating");
            fs::remove_dir_all(layout.root())
                .await
                .with_context(|| format!("Failed to remove old mirror: {:?}", layout.root()))?;
        }
        self.release_claims(layout.root());
        layout.create_skeleton().await?;
        Ok(layout)
    }

    /// Skeleton for a sub-page under `parent/resources/`. `None` when the
    /// directory already exists, meaning that sub-page is already mirrored.
    pub async fn prepare_nested(&self, parent: &PageLayout, title: &str) -> Result<Option<PageLayout>> {
        let layout = PageLayout::new(&parent.dir(AssetDir::Resources), title);
        match fs::create_dir(layout.root()).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %layout.root().display(), "Sub-page already mirrored");
                return Ok(None);
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to create directory: {:?}", layout.root())));
            }
        }
        layout.create_skeleton().await?;
        Ok(Some(layout))
    }

    /// Saves the page served instead of a course, for diagnosis.
    pub async fn save_error_page(&self, course_id: &str, body: &[u8]) -> Result<PathBuf> {
        let path = self.base_dir.join(format!("error_{}.html", course_id));
        self.write_file(&path, body).await?;
        Ok(path)
    }

    /// Writes `content`, retrying while another process holds the file.
    pub async fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        write_with_retry(self.write_retry, path, || fs::write(path, content)).await
    }

    /// The single-flight cell for one asset identity inside one page tree.
    /// The first caller to initialise it downloads; later callers reuse its result.
    pub fn claim(&self, page_root: &Path, key: &str) -> Claim {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims
            .entry((page_root.to_path_buf(), key.to_string()))
            .or_default()
            .clone()
    }

    /// Writes `content` to `path` unless this page tree already wrote it or
    /// found it on disk. Concurrent callers for one path share a single write.
    /// Returns whether this call did the write.
    pub async fn write_once(&self, page_root: &Path, path: &Path, content: &[u8]) -> Result<bool> {
        let claim = self.claim(page_root, &format!("path:{}", path.display()));
        let wrote_here = AtomicBool::new(false);
        let flag = &wrote_here;
        let written = claim
            .get_or_init(|| async move {
                if fs::try_exists(path).await.unwrap_or(false) {
                    debug!(path = %path.display(), "Asset already materialized");
                    return Some(path.display().to_string());
                }
                match self.write_file(path, content).await {
                    Ok(()) => {
                        flag.store(true, Ordering::Relaxed);
                        Some(path.display().to_string())
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %format!("{:#}", e), "Failed to write asset");
                        None
                    }
                }
            })
            .await
            .is_some();

        if written {
            Ok(wrote_here.into_inner())
        } else {
            Err(anyhow::anyhow!("Failed to write file: {:?}", path))
        }
    }

    /// Drops every claim under `page_root` once that tree is finished or rebuilt.
    pub fn release_claims(&self, page_root: &Path) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.retain(|(root, _), _| !root.starts_with(page_root));
    }
}

fn is_lock_contention(err: &io::Error) -> bool {
    // ERROR_ACCESS_DENIED, ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    err.kind() == io::ErrorKind::WouldBlock
        || (cfg!(windows) && matches!(err.raw_os_error(), Some(5 | 32 | 33)))
}

async fn write_with_retry<F, Fut>(policy: RetryPolicy, path: &Path, mut write: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match write().await {
            Ok(()) => return Ok(()),
            Err(e) if is_lock_contention(&e) => {
                warn!(path = %path.display(), attempt, "File is locked, retrying");
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Failed to write file: {:?}", path)));
            }
        }
    }

    Err(MirrorError::WriteContention {
        path: path.to_path_buf(),
        attempts,
    }
    .into())
}
