use mime::Mime;

/// Known mismatches between the MIME subtype a server reports and the
/// extension a file of that type conventionally carries.
///
/// Keys are compared against the subtype (everything after the last `/`),
/// lowercased. Shared by every asset kind so anchors, images, scripts and
/// stylesheets all resolve extensions the same way.
pub static EXTENSION_TABLE: &[(&str, &str)] = &[
    ("msword", "doc"),
    ("vnd.openxmlformats-officedocument.wordprocessingml.document", "docx"),
    ("vnd.ms-powerpoint", "ppt"),
    ("vnd.openxmlformats-officedocument.presentationml.presentation", "pptx"),
    ("vnd.ms-excel", "xls"),
    ("vnd.openxmlformats-officedocument.spreadsheetml.sheet", "xlsx"),
    ("html; charset=utf-8", "html"),
    ("x-ms-wmv", "wmv"),
    ("x-msvideo", "avi"),
    ("quicktime", "mov"),
    ("svg+xml", "svg"),
    ("jpeg", "jpg"),
    ("plain", "txt"),
    ("javascript", "js"),
    ("x-javascript", "js"),
    ("x-icon", "ico"),
    ("vnd.microsoft.icon", "ico"),
];

fn lookup(subtype: &str) -> Option<&'static str> {
    EXTENSION_TABLE
        .iter()
        .find(|(key, _)| *key == subtype)
        .map(|(_, ext)| *ext)
}

/// Maps a `Content-Type` header value (or a bare subtype) to a file extension.
///
/// Never fails: an unknown subtype is returned as-is, minus any parameters.
pub fn resolve_extension(content_type: &str) -> String {
    let raw = content_type
        .rsplit('/')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();

    if let Some(ext) = lookup(&raw) {
        return ext.to_string();
    }

    let subtype = match content_type.trim().parse::<Mime>() {
        Ok(mime) => match mime.suffix() {
            Some(suffix) => format!("{}+{}", mime.subtype(), suffix),
            None => mime.subtype().as_str().to_string(),
        },
        Err(_) => raw.split(';').next().unwrap_or_default().trim().to_string(),
    };

    lookup(&subtype)
        .map(str::to_string)
        .unwrap_or(subtype)
}
