use crate::dom::DomNode;

/// Markup inserted at the start of every document's `<head>`.
///
/// Injected elements are never handed to the rewriter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMaterial {
    /// Script text placed in an inline `<script>` element.
    pub html: Option<String>,
    /// External script URLs, each loaded through its own `<script src>` element.
    pub urls: Vec<String>,
}

impl HeaderMaterial {
    pub fn new(html: Option<String>, urls: Vec<String>) -> Self {
        Self { html, urls }
    }

    /// Returns `true` if nothing would be injected.
    pub fn is_empty(&self) -> bool {
        self.inline_html().is_none() && self.urls.is_empty()
    }

    fn inline_html(&self) -> Option<&str> {
        self.html.as_deref().filter(|html| !html.is_empty())
    }

    /// Builds the elements to insert: one `<script src>` per URL in order,
    /// followed by the inline script if any.
    pub fn elements<N: DomNode>(&self) -> Vec<N> {
        let mut nodes: Vec<N> = self
            .urls
            .iter()
            .map(|url| N::new_element("script", &[("src", url.as_str())], None))
            .collect();
        if let Some(html) = self.inline_html() {
            nodes.push(N::new_element("script", &[], Some(html)));
        }
        nodes
    }

    /// Inserts the header elements as the first children of `head`.
    ///
    /// Returns `false` if there was nothing to insert.
    pub fn inject<N: DomNode>(&self, head: &N) -> bool {
        if self.is_empty() {
            return false;
        }
        head.prepend_children(self.elements());
        true
    }
}
