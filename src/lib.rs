pub mod cli;
pub mod config;
pub mod downloader;
pub mod error;
pub mod file_manager;
pub mod html_parser;
pub mod mime_resolver;
pub mod naming;
pub mod recursion;
pub mod session;

// Re-export main types for convenience
pub use cli::MirrorCommand;
pub use config::{MirrorConfig, RetryPolicy};
pub use downloader::{CourseMirror, PageStats};
pub use error::MirrorError;
pub use file_manager::{sanitize_title, FileManager, PageLayout};
pub use html_parser::{Classification, ElementKind, HtmlParser, Page, ResourceLink, ResourceType};
pub use mime_resolver::resolve_extension;
pub use recursion::{Course, CourseReport, Depth, MirrorTarget, Section, SectionLink};
pub use session::{Credentials, FetchedResponse, Session};
