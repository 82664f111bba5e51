//! Local filenames and target directories for classified references.
//!
//! Resources linked from anchors are named after their Moodle `id=`; inline
//! assets prefer the server's `Content-Disposition` filename and otherwise get
//! a generated unique name. Data URIs are decoded in place.

use anyhow::Result;
use base64::Engine;
use url::Url;

use crate::error::MirrorError;
use crate::html_parser::{ResourceLink, ResourceType};
use crate::mime_resolver::resolve_extension;

pub const FAVICON_NAME: &str = "favicon.ico";

/// Subdirectory of a page's folder that an asset is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetDir {
    Resources,
    Img,
    Css,
    Js,
}

impl AssetDir {
    pub const ALL: [AssetDir; 4] = [AssetDir::Resources, AssetDir::Img, AssetDir::Css, AssetDir::Js];

    pub fn as_str(self) -> &'static str {
        match self {
            AssetDir::Resources => "resources",
            AssetDir::Img => "img",
            AssetDir::Css => "css",
            AssetDir::Js => "js",
        }
    }

    pub fn for_resource(resource_type: ResourceType) -> AssetDir {
        match resource_type {
            ResourceType::ExternalResource | ResourceType::SubPage => AssetDir::Resources,
            ResourceType::InlineImage | ResourceType::DataUriImage | ResourceType::Favicon => AssetDir::Img,
            ResourceType::Script => AssetDir::Js,
            ResourceType::Stylesheet => AssetDir::Css,
        }
    }
}

/// How the final filename of a reference is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileName {
    /// `<id>.<ext>`; the extension is only known once the response arrives.
    ResourceId(String),
    /// Content-disposition name, or a generated one, after fetching.
    FromResponse,
    /// Decoded locally, no request.
    Decoded(DataUri),
    /// Always this name, always overwritten.
    Fixed(&'static str),
    /// Filled in by the recursion step once the sub-page title is known.
    SubPage,
}

/// Where a reference will live and whether it can share an earlier download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingPlan {
    pub dir: AssetDir,
    pub name: FileName,
    /// Identity for deduplication within one page tree; `None` means always fetch.
    pub claim_key: Option<String>,
}

impl NamingPlan {
    pub fn should_deduplicate(&self) -> bool {
        self.claim_key.is_some()
    }
}

/// Decides directory, naming strategy and dedup identity for one reference.
pub fn plan(link: &ResourceLink) -> Result<NamingPlan> {
    let dir = AssetDir::for_resource(link.resource_type);
    let plan = match link.resource_type {
        ResourceType::ExternalResource => {
            let id = resource_id(&link.original_url)
                .ok_or_else(|| MirrorError::malformed(format!("no id= in {}", link.original_url)))?;
            NamingPlan {
                dir,
                claim_key: Some(format!("resource:{}", id)),
                name: FileName::ResourceId(id),
            }
        }
        ResourceType::InlineImage | ResourceType::Script | ResourceType::Stylesheet => NamingPlan {
            dir,
            name: FileName::FromResponse,
            claim_key: Some(format!("url:{}", link.original_url)),
        },
        ResourceType::DataUriImage => NamingPlan {
            dir,
            name: FileName::Decoded(DataUri::parse(&link.original_url)?),
            claim_key: None,
        },
        ResourceType::Favicon => NamingPlan {
            dir,
            name: FileName::Fixed(FAVICON_NAME),
            claim_key: None,
        },
        ResourceType::SubPage => NamingPlan {
            dir,
            name: FileName::SubPage,
            claim_key: None,
        },
    };
    Ok(plan)
}

/// The numeric `id=` query parameter of a Moodle URL.
pub fn resource_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()))
}

/// Name for an asset fetched over HTTP: the server's suggestion if it gave
/// one, otherwise a fresh unique name with the resolved extension.
pub fn response_file_name(disposition: Option<&str>, content_type: Option<&str>) -> String {
    if let Some(name) = disposition.map(sanitize_filename).filter(|n| !n.is_empty()) {
        return name;
    }
    let extension = content_type.map(resolve_extension).unwrap_or_else(|| "bin".to_string());
    generated_name(&extension)
}

pub fn generated_name(extension: &str) -> String {
    format!("{}.{}", uuid::Uuid::new_v4().simple(), extension)
}

/// Parses a Content-Disposition header to extract the filename.
///
/// Handles `filename="a.pdf"`, `filename=a.pdf` and RFC 5987 `filename*=UTF-8''a.pdf`.
pub fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Reduces a server-suggested filename to a single safe path segment.
pub fn sanitize_filename(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    cleaned.to_string()
}

/// An inline `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl DataUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("data:")
            .ok_or_else(|| MirrorError::malformed("not a data URI"))?;
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| MirrorError::malformed("data URI without payload"))?;

        let mut parts = meta.split(';');
        let mime_type = parts
            .next()
            .filter(|m| !m.is_empty())
            .unwrap_or("text/plain")
            .to_ascii_lowercase();
        let is_base64 = parts.any(|p| p.eq_ignore_ascii_case("base64"));

        let bytes = if is_base64 {
            let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| MirrorError::malformed(format!("bad base64 in data URI: {}", e)))?
        } else {
            urlencoding::decode_binary(payload.as_bytes()).into_owned()
        };

        Ok(Self { mime_type, bytes })
    }

    pub fn extension(&self) -> String {
        resolve_extension(&self.mime_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html_parser::ElementKind;

    fn link(resource_type: ResourceType, url: &str) -> ResourceLink {
        ResourceLink {
            node: 0,
            element: ElementKind::Anchor,
            resource_type,
            original_url: url.to_string(),
            text: String::new(),
        }
    }

    #[test]
    fn test_resource_id() {
        assert_eq!(
            resource_id("https://moodle.example.ac.uk/mod/resource/view.php?id=42").as_deref(),
            Some("42")
        );
        assert_eq!(
            resource_id("https://moodle.example.ac.uk/course/view.php?section=3&id=7").as_deref(),
            Some("7")
        );
        assert_eq!(resource_id("https://moodle.example.ac.uk/mod/page/view.php"), None);
        assert_eq!(resource_id("https://moodle.example.ac.uk/mod/page/view.php?id=abc"), None);
    }

    #[test]
    fn test_plan_per_type() {
        let external = plan(&link(
            ResourceType::ExternalResource,
            "https://moodle.example.ac.uk/mod/resource/view.php?id=10",
        ))
        .unwrap();
        assert_eq!(external.dir, AssetDir::Resources);
        assert_eq!(external.name, FileName::ResourceId("10".to_string()));
        assert!(external.should_deduplicate());

        let favicon = plan(&link(ResourceType::Favicon, "https://moodle.example.ac.uk/favicon.ico")).unwrap();
        assert_eq!(favicon.dir, AssetDir::Img);
        assert_eq!(favicon.name, FileName::Fixed(FAVICON_NAME));
        assert!(!favicon.should_deduplicate());

        let script = plan(&link(ResourceType::Script, "https://moodle.example.ac.uk/lib/a.js")).unwrap();
        assert_eq!(script.dir, AssetDir::Js);
        assert_eq!(script.name, FileName::FromResponse);
    }

    #[test]
    fn test_plan_rejects_resource_without_id() {
        let result = plan(&link(
            ResourceType::ExternalResource,
            "https://moodle.example.ac.uk/mod/resource/index.php",
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_content_disposition() {
        assert_eq!(
            parse_content_disposition("attachment; filename=\"notes.pdf\"").as_deref(),
            Some("notes.pdf")
        );
        assert_eq!(
            parse_content_disposition("inline; filename=logo.png; size=10").as_deref(),
            Some("logo.png")
        );
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''caf%C3%A9.css").as_deref(),
            Some("café.css")
        );
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn test_response_file_name() {
        assert_eq!(response_file_name(Some("../../etc/passwd"), None), "passwd");
        assert_eq!(response_file_name(Some("a:b.png"), Some("image/png")), "a_b.png");

        let generated = response_file_name(None, Some("image/svg+xml"));
        assert!(generated.ends_with(".svg"));
        assert_ne!(generated, response_file_name(None, Some("image/svg+xml")));

        assert!(response_file_name(None, None).ends_with(".bin"));
    }

    #[test]
    fn test_data_uri_base64() {
        let uri = DataUri::parse("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(uri.mime_type, "image/png");
        assert_eq!(uri.bytes, b"hello");
        assert_eq!(uri.extension(), "png");

        let svg = DataUri::parse("data:image/svg+xml,%3Csvg%2F%3E").unwrap();
        assert_eq!(svg.bytes, b"<svg/>");
        assert_eq!(svg.extension(), "svg");
    }

    #[test]
    fn test_data_uri_rejects_garbage() {
        assert!(DataUri::parse("data:image/png;base64").is_err());
        assert!(DataUri::parse("data:image/png;base64,!!!").is_err());
        assert!(DataUri::parse("https://example.com/a.png").is_err());
    }
}
