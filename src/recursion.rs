//! Course and section targets, and the one-level recursion between them.
//!
//! A course page may pull in its sections; a section page never pulls in
//! anything further. The split is carried by the [`Depth`] marker on
//! [`MirrorTarget`]: only a `MirrorTarget<Course>` can be passed to
//! [`CourseMirror::mirror_section`], so there is no code path that mirrors
//! a section of a section.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::fs;
use tracing::{info, warn};
use url::Url;

use crate::downloader::{CourseMirror, PageStats};
use crate::error::MirrorError;
use crate::file_manager::{sanitize_title, PageLayout};
use crate::html_parser::{HtmlParser, Page, ResourceLink};
use crate::naming::AssetDir;

mod sealed {
    pub trait Sealed {}
}

/// Nesting level of a mirrored page.
pub trait Depth: sealed::Sealed {
    const LEVEL: u8;
    /// Whether section links on this page are mirrored as sub-pages.
    const FOLLOWS_SECTIONS: bool;
}

/// Depth 0: a course's root page.
pub enum Course {}

/// Depth 1: a section reached from a course page.
pub enum Section {}

impl sealed::Sealed for Course {}
impl sealed::Sealed for Section {}

impl Depth for Course {
    const LEVEL: u8 = 0;
    const FOLLOWS_SECTIONS: bool = true;
}

impl Depth for Section {
    const LEVEL: u8 = 1;
    const FOLLOWS_SECTIONS: bool = false;
}

/// One page being mirrored.
pub struct MirrorTarget<D: Depth> {
    pub url: Url,
    pub course_id: String,
    pub section: Option<u32>,
    pub raw_title: String,
    pub layout: PageLayout,
    depth: PhantomData<D>,
}

impl<D: Depth> MirrorTarget<D> {
    pub fn title(&self) -> &str {
        self.layout.title()
    }

    pub fn depth(&self) -> u8 {
        D::LEVEL
    }
}

impl MirrorTarget<Course> {
    pub fn course(url: Url, course_id: &str, raw_title: String, layout: PageLayout) -> Self {
        Self {
            url,
            course_id: course_id.to_string(),
            section: None,
            raw_title,
            layout,
            depth: PhantomData,
        }
    }

    fn section_target(&self, url: Url, link: &SectionLink, layout: PageLayout) -> MirrorTarget<Section> {
        MirrorTarget {
            url,
            course_id: self.course_id.clone(),
            section: Some(link.section),
            raw_title: link.raw_title.clone(),
            layout,
            depth: PhantomData,
        }
    }
}

/// A section link found on a course page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionLink {
    pub section: u32,
    pub raw_title: String,
    /// Directory and file stem of the mirrored section.
    pub title: String,
}

impl SectionLink {
    /// The section number comes from the URL, the title from the anchor text.
    pub fn from_link(parser: &HtmlParser, link: &ResourceLink) -> Option<Self> {
        let url = Url::parse(&link.original_url).ok()?;
        let section = parser.section_number(&url)?;
        let raw_title = if link.text.is_empty() {
            format!("Section {}", section)
        } else {
            link.text.clone()
        };
        Some(Self {
            section,
            title: sanitize_title(&raw_title),
            raw_title,
        })
    }

    /// Appends ` (<n>)` until the title differs from every title in `taken`.
    pub fn unique_among(mut self, taken: &HashSet<String>) -> Self {
        while taken.contains(&self.title) {
            self.title = format!("{} ({})", self.title, self.section);
        }
        self
    }
}

/// Summary of one mirrored course.
#[derive(Debug, Clone)]
pub struct CourseReport {
    pub course_id: String,
    pub title: String,
    pub path: PathBuf,
    pub stats: PageStats,
}

fn course_title_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^Course:\s*([\w\W]+)$").expect("valid regex"))
}

/// `Course: Intro to X` -> `Intro to X`; other titles are kept whole.
pub fn course_title(page_title: &str) -> String {
    course_title_pattern()
        .captures(page_title.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| page_title.trim().to_string())
}

impl CourseMirror {
    /// Mirrors one course and its sections into `<output>/<course title>/`.
    ///
    /// Fails with [`MirrorError::AccessDenied`] when the course page is not
    /// served; every other problem below the root page only degrades the copy.
    pub async fn mirror_course(&self, course_id: &str) -> Result<CourseReport> {
        let view_url = self.config().course_view_url()?;
        let response = self.session().get(&view_url, &[("id", course_id)]).await?;

        let page = Page::parse(&response.text());
        let page_title = page.title().unwrap_or_default();
        if !response.is_success() || !page_title.starts_with("Course") {
            let saved_to = self.files().save_error_page(course_id, &response.body).await?;
            return Err(MirrorError::AccessDenied {
                course_id: course_id.to_string(),
                status: response.status.as_u16(),
                title: page_title,
                saved_to,
            }
            .into());
        }

        let title = sanitize_title(&course_title(&page_title));
        info!(course_id, title = %title, "Found course");

        let layout = self.files().prepare_fresh(&title).await?;
        let target = MirrorTarget::course(response.url.clone(), course_id, page_title, layout);

        let result = self.mirror_course_page(&target, page, &response.body).await;
        self.files().release_claims(target.layout.root());
        let stats = result?;

        Ok(CourseReport {
            course_id: course_id.to_string(),
            title,
            path: target.layout.root().to_path_buf(),
            stats,
        })
    }

    async fn mirror_course_page(&self, target: &MirrorTarget<Course>, page: Page, raw: &[u8]) -> Result<PageStats> {
        let parser = HtmlParser::new(target.url.as_str(), &target.course_id)?;
        let mut outcome = self.mirror_page(target, &parser, page, raw).await?;

        // Section number -> mirrored title, `None` once a section failed.
        let mut mirrored: HashMap<u32, Option<String>> = HashMap::new();
        let mut taken: HashSet<String> = HashSet::new();

        for link in &outcome.sections {
            let Some(section) = SectionLink::from_link(&parser, link) else {
                outcome.stats.skipped += 1;
                continue;
            };

            let child_title = match mirrored.get(&section.section) {
                Some(known) => known.clone(),
                None => {
                    let section = section.unique_among(&taken);
                    taken.insert(section.title.clone());
                    let child_title = match self.mirror_section(target, &section).await {
                        Ok((child_title, child_stats)) => {
                            outcome.stats.absorb(&child_stats);
                            Some(child_title)
                        }
                        Err(e) => {
                            warn!(
                                course_id = %target.course_id,
                                section = section.section,
                                error = %format!("{:#}", e),
                                "Failed to mirror section"
                            );
                            None
                        }
                    };
                    mirrored.insert(section.section, child_title.clone());
                    child_title
                }
            };

            let Some(child_title) = child_title else {
                outcome.stats.failed += 1;
                continue;
            };
            let child = PageLayout::new(&target.layout.dir(AssetDir::Resources), &child_title);
            let rewritten = target
                .layout
                .relative(&child.html_path())
                .is_some_and(|relative| outcome.page.set_attribute(link.node, "href", &relative));
            if rewritten {
                outcome.stats.sub_pages += 1;
            } else {
                outcome.stats.failed += 1;
            }
        }

        self.finish_page(target, &outcome.page).await?;
        Ok(outcome.stats)
    }

    /// Mirrors one section under the course's `resources/` folder and returns
    /// its sanitized title. An existing section folder is reused untouched,
    /// without any request.
    pub async fn mirror_section(
        &self,
        parent: &MirrorTarget<Course>,
        section: &SectionLink,
    ) -> Result<(String, PageStats)> {
        let planned = PageLayout::new(&parent.layout.dir(AssetDir::Resources), &section.title);
        if fs::try_exists(planned.root()).await.unwrap_or(false) {
            info!(section = section.section, title = %section.title, "Section already mirrored");
            return Ok((section.title.clone(), PageStats::default()));
        }

        let view_url = self.config().course_view_url()?;
        let section_number = section.section.to_string();
        let response = self
            .session()
            .get(
                &view_url,
                &[("id", parent.course_id.as_str()), ("section", section_number.as_str())],
            )
            .await?
            .error_for_status()?;

        let Some(layout) = self.files().prepare_nested(&parent.layout, &section.title).await? else {
            return Ok((section.title.clone(), PageStats::default()));
        };

        let target = parent.section_target(response.url.clone(), section, layout);
        info!(section = section.section, title = %target.title(), "Mirroring section");

        let result = async {
            let parser = HtmlParser::new(target.url.as_str(), &target.course_id)?;
            let page = Page::parse(&response.text());
            let outcome = self.mirror_page(&target, &parser, page, &response.body).await?;
            self.finish_page(&target, &outcome.page).await?;
            Ok::<_, anyhow::Error>(outcome.stats)
        }
        .await;

        match result {
            Ok(stats) => Ok((section.title.clone(), stats)),
            Err(e) => {
                // A half-written folder would be mistaken for a finished one next time.
                fs::remove_dir_all(target.layout.root())
                    .await
                    .with_context(|| format!("Failed to clean up {:?}", target.layout.root()))?;
                Err(e)
            }
        }
    }
}
