//! Decides how a response body is treated by the proxy.

/// Handling category of an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Classification {
    /// Whole body is a script and is rewritten as one unit.
    #[display("JavaScript")]
    JavaScript,
    /// Body is a document whose script sites are rewritten.
    #[display("HTML")]
    Html,
    /// Body is relayed untouched.
    #[display("other")]
    Other,
}

impl Classification {
    /// Returns `true` if the body has to be buffered before it is relayed.
    pub fn needs_buffering(self) -> bool {
        !matches!(self, Classification::Other)
    }
}

/// Classifies a response from its declared content type and the request path.
///
/// First match wins:
/// 1. `bypassed` (the request URL is exempt from instrumentation) gives [`Classification::Other`].
/// 2. A content type containing `javascript`, or containing `text` while the path ends
///    in `.js`, gives [`Classification::JavaScript`].
/// 3. A content type containing `html` gives [`Classification::Html`].
/// 4. Anything else gives [`Classification::Other`].
///
/// All comparisons are ASCII case-insensitive. The body is never inspected.
pub fn classify(content_type: Option<&str>, path: &str, bypassed: bool) -> Classification {
    if bypassed {
        return Classification::Other;
    }
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    let is_js_path = path.to_ascii_lowercase().ends_with(".js");
    if content_type.contains("javascript") || (content_type.contains("text") && is_js_path) {
        Classification::JavaScript
    } else if content_type.contains("html") {
        Classification::Html
    } else {
        Classification::Other
    }
}
