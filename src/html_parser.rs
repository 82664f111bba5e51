use anyhow::{Context, Result};
use html5ever::serialize::{serialize, SerializeOpts};
use html5ever::tendril::TendrilSink;
use html5ever::{parse_document, ParseOpts};
use markup5ever_rcdom::{Handle, NodeData, RcDom, SerializableHandle};
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Element a reference was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Anchor,
    Image,
    Script,
    Link,
}

impl ElementKind {
    /// The attribute holding the URL for this element.
    pub fn attribute(self) -> &'static str {
        match self {
            ElementKind::Anchor | ElementKind::Link => "href",
            ElementKind::Image | ElementKind::Script => "src",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// A course document linked from an anchor (`/resource/`, `/page/`).
    ExternalResource,
    /// A section of the same course, mirrored recursively.
    SubPage,
    InlineImage,
    DataUriImage,
    Script,
    Stylesheet,
    Favicon,
}

/// One reference discovered in a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLink {
    /// Index into [`Page`]'s element list, used to rewrite the attribute later.
    pub node: usize,
    pub element: ElementKind,
    pub resource_type: ResourceType,
    /// Absolute URL, or the complete `data:` URI for inline images.
    pub original_url: String,
    /// Visible text of an anchor, empty for other elements.
    pub text: String,
}

/// Result of classifying one page.
#[derive(Debug, Default)]
pub struct Classification {
    pub links: Vec<ResourceLink>,
    /// References dropped because they had no usable URL.
    pub skipped: usize,
}

impl Classification {
    pub fn of_type(&self, resource_type: ResourceType) -> impl Iterator<Item = &ResourceLink> {
        self.links.iter().filter(move |l| l.resource_type == resource_type)
    }
}

/// A parsed HTML document that can be rewritten in place and serialized back.
pub struct Page {
    dom: RcDom,
    /// Every element in document order.
    elements: Vec<Handle>,
}

impl Page {
    pub fn parse(html: &str) -> Self {
        let dom = parse_document(RcDom::default(), ParseOpts::default()).one(html);

        let mut elements = Vec::new();
        let mut stack = vec![dom.document.clone()];
        while let Some(node) = stack.pop() {
            if matches!(node.data, NodeData::Element { .. }) {
                elements.push(node.clone());
            }
            for child in node.children.borrow().iter().rev() {
                stack.push(child.clone());
            }
        }

        Self { dom, elements }
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn tag_name(&self, node: usize) -> Option<String> {
        match &self.elements.get(node)?.data {
            NodeData::Element { name, .. } => Some(name.local.to_string()),
            _ => None,
        }
    }

    pub fn attribute(&self, node: usize, attribute: &str) -> Option<String> {
        match &self.elements.get(node)?.data {
            NodeData::Element { attrs, .. } => attrs
                .borrow()
                .iter()
                .find(|a| &*a.name.local == attribute)
                .map(|a| a.value.to_string()),
            _ => None,
        }
    }

    /// Replaces an existing attribute value. Returns false if the node or attribute is missing.
    pub fn set_attribute(&self, node: usize, attribute: &str, value: &str) -> bool {
        let Some(handle) = self.elements.get(node) else {
            return false;
        };
        match &handle.data {
            NodeData::Element { attrs, .. } => {
                let mut attrs = attrs.borrow_mut();
                match attrs.iter_mut().find(|a| &*a.name.local == attribute) {
                    Some(attr) => {
                        attr.value = value.into();
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Concatenated text below an element, whitespace collapsed.
    pub fn text(&self, node: usize) -> String {
        self.elements
            .get(node)
            .map(|handle| collapse_whitespace(&text_content(handle)))
            .unwrap_or_default()
    }

    pub fn title(&self) -> Option<String> {
        let node = (0..self.elements.len()).find(|&i| self.tag_name(i).as_deref() == Some("title"))?;
        let title = self.text(node);
        (!title.is_empty()).then_some(title)
    }

    pub fn to_html(&self) -> Result<String> {
        let mut out = Vec::new();
        let document: SerializableHandle = self.dom.document.clone().into();
        serialize(&mut out, &document, SerializeOpts::default()).context("Failed to serialize HTML")?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

fn text_content(handle: &Handle) -> String {
    let mut text = String::new();
    let mut stack = vec![handle.clone()];
    while let Some(node) = stack.pop() {
        if let NodeData::Text { contents } = &node.data {
            text.push_str(&contents.borrow());
        }
        for child in node.children.borrow().iter().rev() {
            stack.push(child.clone());
        }
    }
    text
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn document_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/(resource|page)/").expect("valid regex"))
}

/// Classifies the references of pages belonging to one course.
#[derive(Clone)]
pub struct HtmlParser {
    page_url: Url,
    course_id: String,
}

impl HtmlParser {
    pub fn new(page_url: &str, course_id: &str) -> Result<Self> {
        let page_url = Url::parse(page_url)
            .with_context(|| format!("Failed to parse page URL: {}", page_url))?;

        Ok(Self {
            page_url,
            course_id: course_id.to_string(),
        })
    }

    /// Partitions a page's anchors, images, scripts and links into tagged references.
    ///
    /// Section links become [`ResourceType::SubPage`] only when `follow_sections`
    /// is set, i.e. on a course's root page.
    pub fn classify(&self, page: &Page, follow_sections: bool) -> Classification {
        let mut result = Classification::default();
        let mut favicon_seen = false;

        for node in 0..page.element_count() {
            let Some(tag) = page.tag_name(node) else {
                continue;
            };

            let (element, resource_type, original_url) = match tag.as_str() {
                "a" => {
                    let Some(href) = page.attribute(node, "href") else {
                        result.skipped += 1;
                        continue;
                    };
                    let Ok(url) = self.resolve_url(&href) else {
                        result.skipped += 1;
                        continue;
                    };
                    let resource_type = if self.section_number(&url).is_some() {
                        if follow_sections {
                            ResourceType::SubPage
                        } else {
                            ResourceType::ExternalResource
                        }
                    } else if document_link_pattern().is_match(url.path()) {
                        ResourceType::ExternalResource
                    } else {
                        continue;
                    };
                    (ElementKind::Anchor, resource_type, url.to_string())
                }
                "img" => {
                    let Some(src) = page.attribute(node, "src") else {
                        result.skipped += 1;
                        continue;
                    };
                    if src.trim_start().starts_with("data:") {
                        (ElementKind::Image, ResourceType::DataUriImage, src.trim().to_string())
                    } else {
                        match self.resolve_http_url(&src) {
                            Some(url) => (ElementKind::Image, ResourceType::InlineImage, url.to_string()),
                            None => {
                                result.skipped += 1;
                                continue;
                            }
                        }
                    }
                }
                "script" => {
                    let Some(src) = page.attribute(node, "src") else {
                        continue;
                    };
                    match self.resolve_http_url(&src) {
                        Some(url) => (ElementKind::Script, ResourceType::Script, url.to_string()),
                        None => {
                            result.skipped += 1;
                            continue;
                        }
                    }
                }
                "link" => {
                    let Some(href) = page.attribute(node, "href") else {
                        continue;
                    };
                    let Some(url) = self.resolve_http_url(&href) else {
                        result.skipped += 1;
                        continue;
                    };
                    let is_icon = page
                        .attribute(node, "rel")
                        .map(|rel| is_icon_rel(&rel))
                        .unwrap_or(false);
                    if is_icon {
                        if favicon_seen {
                            continue;
                        }
                        favicon_seen = true;
                        (ElementKind::Link, ResourceType::Favicon, url.to_string())
                    } else {
                        (ElementKind::Link, ResourceType::Stylesheet, url.to_string())
                    }
                }
                _ => continue,
            };

            let text = if element == ElementKind::Anchor {
                page.text(node)
            } else {
                String::new()
            };

            result.links.push(ResourceLink {
                node,
                element,
                resource_type,
                original_url,
                text,
            });
        }

        result
    }

    /// Absolute form of `url`; protocol-relative URLs are pinned to `https:`.
    pub fn resolve_url(&self, url: &str) -> Result<Url> {
        let url = url.trim();
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Url::parse(url)?)
        } else if url.starts_with("//") {
            Ok(Url::parse(&format!("https:{}", url))?)
        } else {
            Ok(self.page_url.join(url)?)
        }
    }

    fn resolve_http_url(&self, url: &str) -> Option<Url> {
        self.resolve_url(url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
    }

    /// `Some(n)` for `.../course/view.php?id=<this course>&section=<n>`.
    pub fn section_number(&self, url: &Url) -> Option<u32> {
        if !url.path().ends_with("/course/view.php") {
            return None;
        }
        let mut same_course = false;
        let mut section = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "id" => same_course = value == self.course_id.as_str(),
                "section" => section = value.parse::<u32>().ok(),
                _ => {}
            }
        }
        if same_course {
            section
        } else {
            None
        }
    }
}

fn is_icon_rel(rel: &str) -> bool {
    let rel = rel.to_ascii_lowercase();
    rel.split_whitespace().any(|token| token == "icon")
}
