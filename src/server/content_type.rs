use std::path::Path;

/// Maps an asset path to the `Content-Type` value sent with it.
pub trait ContentTypeResolver: Send + Sync {
    fn lookup(&self, path: &Path) -> &str;
}

/// Extension-based lookup with a `text/html` fallback.
pub struct ExtensionContentTypes;

impl ContentTypeResolver for ExtensionContentTypes {
    fn lookup(&self, path: &Path) -> &str {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("js") => "text/javascript",
            Some("css") => "text/css",
            Some("jpeg") | Some("jpg") => "image/jpeg",
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("svg") => "image/svg+xml",
            Some("json") => "application/json",
            Some("txt") => "text/plain",
            _ => "text/html",
        }
    }
}
