use std::path::PathBuf;
use std::time::Duration;

use url::Url;

/// Fixed-delay retry used when a destination file is locked by another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(250),
        }
    }
}

/// Validated settings for one mirror run.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Moodle root, e.g. `https://moodle.example.ac.uk`.
    pub base_url: Url,
    pub output_dir: PathBuf,
    /// Concurrent asset downloads per page.
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub write_retry: RetryPolicy,
    /// Extra attempts for requests that failed to connect.
    pub fetch_retries: u32,
    pub accept_invalid_certs: bool,
    /// Draw a progress bar per page.
    pub show_progress: bool,
}

impl MirrorConfig {
    pub fn new(base_url: Url, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url,
            output_dir: output_dir.into(),
            max_concurrent: 8,
            timeout: Duration::from_secs(60),
            write_retry: RetryPolicy::default(),
            fetch_retries: 2,
            accept_invalid_certs: false,
            show_progress: false,
        }
    }

    /// `{base}/course/view.php`, tolerating a base URL with or without a trailing slash.
    pub fn course_view_url(&self) -> anyhow::Result<Url> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join("course/view.php")?)
    }
}
