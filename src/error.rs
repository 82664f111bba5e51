use std::path::PathBuf;

use thiserror::Error;

/// Failures a caller has to tell apart from generic I/O errors.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The root page was not served or did not look like a course page.
    /// Fatal for that course only.
    #[error("course {course_id} is not accessible (HTTP {status}, page title {title:?}); error page saved to {}", .saved_to.display())]
    AccessDenied {
        course_id: String,
        status: u16,
        title: String,
        saved_to: PathBuf,
    },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    /// The destination stayed locked for every retry attempt.
    #[error("{} was still locked after {attempts} write attempts", .path.display())]
    WriteContention { path: PathBuf, attempts: u32 },

    #[error("malformed reference: {reason}")]
    MalformedReference { reason: String },
}

impl MirrorError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedReference {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_message_names_saved_page() {
        let err = MirrorError::AccessDenied {
            course_id: "123".to_string(),
            status: 200,
            title: "Log in to the site".to_string(),
            saved_to: PathBuf::from("output/error_123.html"),
        };
        let message = err.to_string();
        assert!(message.contains("course 123"));
        assert!(message.contains("output/error_123.html"));
    }
}
