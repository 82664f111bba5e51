use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::file_manager::FileManager;
use crate::html_parser::{HtmlParser, Page, ResourceLink, ResourceType};
use crate::mime_resolver::resolve_extension;
use crate::naming::{self, FileName, NamingPlan};
use crate::recursion::{Depth, MirrorTarget};
use crate::session::Session;

/// Counters for one page, or a course including its sections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
    /// Assets downloaded or decoded and written.
    pub fetched: usize,
    /// References pointed at an asset another reference already materialized.
    pub reused: usize,
    /// References without a usable URL.
    pub skipped: usize,
    /// References left unrewritten after a failed fetch or write.
    pub failed: usize,
    pub sub_pages: usize,
}

impl PageStats {
    pub fn absorb(&mut self, other: &PageStats) {
        self.fetched += other.fetched;
        self.reused += other.reused;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.sub_pages += other.sub_pages;
    }
}

/// A page whose assets are rewritten but whose section links are still pending.
pub struct PageOutcome {
    pub page: Page,
    pub sections: Vec<ResourceLink>,
    pub stats: PageStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AssetOutcome {
    Fetched(String),
    Reused(String),
    Skipped,
    Failed,
}

/// Mirrors courses through one shared session.
pub struct CourseMirror {
    session: Session,
    config: MirrorConfig,
    files: FileManager,
}

impl CourseMirror {
    pub fn new(session: Session, config: MirrorConfig) -> Result<Self> {
        let files = FileManager::new(&config.output_dir, config.write_retry)?;

        Ok(Self {
            session,
            config,
            files,
        })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    /// Saves the raw page, classifies it and downloads every asset, rewriting
    /// each successfully materialized reference to its local relative path.
    ///
    /// Section links are returned untouched in [`PageOutcome::sections`].
    pub async fn mirror_page<D: Depth>(
        &self,
        target: &MirrorTarget<D>,
        parser: &HtmlParser,
        page: Page,
        raw: &[u8],
    ) -> Result<PageOutcome> {
        self.files.write_file(&target.layout.raw_path(), raw).await?;

        let classification = parser.classify(&page, D::FOLLOWS_SECTIONS);
        let mut stats = PageStats {
            skipped: classification.skipped,
            ..PageStats::default()
        };

        let (sections, assets): (Vec<_>, Vec<_>) = classification
            .links
            .into_iter()
            .partition(|link| link.resource_type == ResourceType::SubPage);

        info!(
            title = %target.title(),
            depth = target.depth(),
            assets = assets.len(),
            sections = sections.len(),
            "Mirroring page"
        );

        let progress = self.progress_bar(assets.len() as u64, target.title());
        let progress = &progress;

        let results: Vec<(ResourceLink, AssetOutcome)> = stream::iter(assets)
            .map(|link| async move {
                let outcome = self.materialize(target, &link).await;
                progress.inc(1);
                (link, outcome)
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        progress.finish_and_clear();

        for (link, outcome) in results {
            let relative = match outcome {
                AssetOutcome::Fetched(relative) => {
                    stats.fetched += 1;
                    relative
                }
                AssetOutcome::Reused(relative) => {
                    stats.reused += 1;
                    relative
                }
                AssetOutcome::Skipped => {
                    stats.skipped += 1;
                    continue;
                }
                AssetOutcome::Failed => {
                    stats.failed += 1;
                    continue;
                }
            };
            if page.set_attribute(link.node, link.element.attribute(), &relative) {
                debug!(url = %short_url(&link), local = %relative, "Rewrote reference");
            } else {
                stats.failed += 1;
            }
        }

        Ok(PageOutcome {
            page,
            sections,
            stats,
        })
    }

    /// Serializes the rewritten document to `<root>/<title>.html`.
    pub async fn finish_page<D: Depth>(&self, target: &MirrorTarget<D>, page: &Page) -> Result<()> {
        let html = page.to_html()?;
        self.files
            .write_file(&target.layout.html_path(), html.as_bytes())
            .await
            .with_context(|| format!("Failed to save {}", target.title()))
    }

    fn progress_bar(&self, len: u64, title: &str) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let progress_bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{bar:30}] {pos}/{len}") {
            progress_bar.set_style(style);
        }
        progress_bar.set_message(title.to_string());
        progress_bar
    }

    async fn materialize<D: Depth>(&self, target: &MirrorTarget<D>, link: &ResourceLink) -> AssetOutcome {
        let plan = match naming::plan(link) {
            Ok(plan) => plan,
            Err(e) => {
                debug!(url = %short_url(link), error = %e, "Skipping reference");
                return AssetOutcome::Skipped;
            }
        };

        let Some(key) = plan.claim_key.as_deref() else {
            return match self.download(target, link, &plan).await {
                Some(relative) => AssetOutcome::Fetched(relative),
                None => AssetOutcome::Failed,
            };
        };

        let claim = self.files.claim(target.layout.root(), key);
        let downloaded_here = AtomicBool::new(false);
        let flag = &downloaded_here;
        let plan = &plan;
        let result = claim
            .get_or_init(|| async move {
                flag.store(true, Ordering::Relaxed);
                self.download(target, link, plan).await
            })
            .await
            .clone();

        match (result, downloaded_here.into_inner()) {
            (Some(relative), true) => AssetOutcome::Fetched(relative),
            (Some(relative), false) => AssetOutcome::Reused(relative),
            (None, _) => AssetOutcome::Failed,
        }
    }

    async fn download<D: Depth>(
        &self,
        target: &MirrorTarget<D>,
        link: &ResourceLink,
        plan: &NamingPlan,
    ) -> Option<String> {
        match self.try_download(target, link, plan).await {
            Ok(relative) => Some(relative),
            Err(e) => {
                warn!(url = %short_url(link), error = %format!("{:#}", e), "Failed to mirror asset");
                None
            }
        }
    }

    async fn try_download<D: Depth>(
        &self,
        target: &MirrorTarget<D>,
        link: &ResourceLink,
        plan: &NamingPlan,
    ) -> Result<String> {
        let dir = target.layout.dir(plan.dir);

        let path: PathBuf = match &plan.name {
            FileName::SubPage => {
                return Err(MirrorError::malformed("sub-pages are mirrored by the recursion step").into());
            }
            FileName::Decoded(data) => {
                let path = dir.join(naming::generated_name(&data.extension()));
                self.files.write_file(&path, &data.bytes).await?;
                path
            }
            FileName::ResourceId(_) | FileName::FromResponse | FileName::Fixed(_) => {
                let url = Url::parse(&link.original_url)
                    .with_context(|| format!("Invalid URL: {}", link.original_url))?;
                let response = self.session.get(&url, &[]).await?.error_for_status()?;

                let name = match &plan.name {
                    FileName::ResourceId(id) => {
                        let extension = response
                            .content_type()
                            .map(resolve_extension)
                            .unwrap_or_else(|| "bin".to_string());
                        format!("{}.{}", id, extension)
                    }
                    FileName::Fixed(name) => name.to_string(),
                    _ => naming::response_file_name(
                        response.content_disposition_filename().as_deref(),
                        response.content_type(),
                    ),
                };

                let path = dir.join(&name);
                if matches!(plan.name, FileName::FromResponse) {
                    // Different URLs may suggest the same file name.
                    self.files
                        .write_once(target.layout.root(), &path, &response.body)
                        .await?;
                } else {
                    self.files.write_file(&path, &response.body).await?;
                }
                path
            }
        };

        target
            .layout
            .relative(&path)
            .ok_or_else(|| MirrorError::malformed(format!("{:?} is outside the page folder", path)).into())
    }
}

fn short_url(link: &ResourceLink) -> &str {
    if link.resource_type == ResourceType::DataUriImage {
        let end = link.original_url.find(',').unwrap_or(link.original_url.len());
        &link.original_url[..end]
    } else {
        &link.original_url
    }
}
