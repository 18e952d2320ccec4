//! Locates every script site in a document tree and rewrites it in place.

use n0_error::e;
use tracing::debug;

use crate::{
    dom::{DomNode, HtmlDocument, NodeKind},
    error::DocumentError,
    header::HeaderMaterial,
    rewrite::{RewriteMetadata, ScriptGateway, SiteKind, split_javascript_scheme},
};

/// Attributes whose value is an event handler script.
pub const EVENT_HANDLER_ATTRIBUTES: &[&str] = &[
    "onabort",
    "onblur",
    "onchange",
    "onclick",
    "ondblclick",
    "onerror",
    "onfocus",
    "onkeydown",
    "onkeypress",
    "onkeyup",
    "onload",
    "onmousedown",
    "onmousemove",
    "onmouseout",
    "onmouseover",
    "onmouseup",
    "onreset",
    "onresize",
    "onselect",
    "onsubmit",
    "onunload",
];

/// Attributes that may hold a `javascript:` URL.
pub const URL_ATTRIBUTES: &[&str] = &[
    "action", "cite", "code", "codebase", "data", "href", "manifest", "poster", "src",
];

/// Per-document counters behind the synthetic site identifiers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SiteCounters {
    pub inline: usize,
    pub event_handler: usize,
    pub js_url: usize,
}

impl SiteCounters {
    /// Returns the next identifier for a site of `kind`, e.g. `{url}#inline-0`.
    pub fn next_id(&mut self, url: &str, kind: SiteKind) -> String {
        let (tag, counter) = match kind {
            SiteKind::Script => ("inline", &mut self.inline),
            SiteKind::EventHandler => ("event-handler", &mut self.event_handler),
            SiteKind::JavascriptUrl => ("js-url", &mut self.js_url),
        };
        let id = format!("{url}#{tag}-{counter}");
        *counter += 1;
        id
    }
}

/// Pre-order walk over one document.
///
/// Each walker owns its counters, so identifiers never leak between documents.
#[derive(Debug)]
pub struct SiteWalker<'a> {
    url: &'a str,
    gateway: &'a ScriptGateway,
    header: &'a HeaderMaterial,
    counters: SiteCounters,
    modified: bool,
}

impl<'a> SiteWalker<'a> {
    pub fn new(url: &'a str, gateway: &'a ScriptGateway, header: &'a HeaderMaterial) -> Self {
        Self {
            url,
            gateway,
            header,
            counters: SiteCounters::default(),
            modified: false,
        }
    }

    pub fn counters(&self) -> &SiteCounters {
        &self.counters
    }

    /// Returns `true` once any site changed or header material was injected.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Walks the tree below `root`, rewriting script sites in document order.
    ///
    /// At each element, event handler attributes are rewritten before
    /// `javascript:` URL attributes, and both before any descendant.
    pub fn walk<N: DomNode>(&mut self, root: &N) -> Result<(), DocumentError> {
        let mut stack = vec![root.clone()];
        while let Some(node) = stack.pop() {
            let children = self.visit(&node)?;
            stack.extend(children.into_iter().rev());
        }
        Ok(())
    }

    /// Handles a single node and returns the children to descend into.
    fn visit<N: DomNode>(&mut self, node: &N) -> Result<Vec<N>, DocumentError> {
        if node.kind() != NodeKind::Element {
            return Ok(node.children());
        }
        if node.is_element("head") && !self.header.is_empty() {
            // Snapshot first so the injected elements are never visited.
            let children = node.children();
            self.modified |= self.header.inject(node);
            return Ok(children);
        }
        let children = node.children();
        if node.is_element("script") && !children.is_empty() {
            self.rewrite_inline_script(node, &children)?;
            return Ok(node.children());
        }
        self.rewrite_attributes(node);
        Ok(children)
    }

    fn rewrite_inline_script<N: DomNode>(
        &mut self,
        script: &N,
        children: &[N],
    ) -> Result<(), DocumentError> {
        if script.attribute("src").is_some() || !is_javascript_type(script.attribute("type")) {
            return Ok(());
        }
        let mut source = String::new();
        for child in children {
            match child.kind() {
                NodeKind::Text | NodeKind::Comment => {
                    source.push_str(&child.text().unwrap_or_default())
                }
                kind => return Err(e!(DocumentError::UnexpectedScriptChild { kind })),
            }
        }
        let id = self.counters.next_id(self.url, SiteKind::Script);
        let metadata = RewriteMetadata::in_document(SiteKind::Script, id);
        let rewritten = self.gateway.rewrite(&source, &metadata);
        if rewritten != source {
            script.replace_children_with_text(&rewritten);
            self.modified = true;
        }
        Ok(())
    }

    fn rewrite_attributes<N: DomNode>(&mut self, element: &N) {
        for name in EVENT_HANDLER_ATTRIBUTES {
            if let Some(value) = element.attribute(name) {
                self.rewrite_attribute(element, name, &value, SiteKind::EventHandler);
            }
        }
        for name in URL_ATTRIBUTES {
            let Some(value) = element.attribute(name) else {
                continue;
            };
            if !split_javascript_scheme(&value).0.is_empty() {
                self.rewrite_attribute(element, name, &value, SiteKind::JavascriptUrl);
            }
        }
    }

    fn rewrite_attribute<N: DomNode>(
        &mut self,
        element: &N,
        name: &str,
        value: &str,
        kind: SiteKind,
    ) {
        let id = self.counters.next_id(self.url, kind);
        let metadata = RewriteMetadata::in_document(kind, id);
        let rewritten = self.gateway.rewrite(value, &metadata);
        if rewritten != value {
            element.set_attribute(name, &rewritten);
            self.modified = true;
        }
    }
}

/// Scripts without a type, or whose type mentions JavaScript, are JavaScript.
fn is_javascript_type(script_type: Option<String>) -> bool {
    match script_type {
        None => true,
        Some(t) => t.is_empty() || t.to_ascii_lowercase().contains("javascript"),
    }
}

/// Rewrites every script site in `html` and injects `header` into its `<head>`.
///
/// Returns `html` unchanged if nothing was rewritten or injected.
pub fn rewrite_html(
    html: &str,
    url: &str,
    gateway: &ScriptGateway,
    header: &HeaderMaterial,
) -> Result<String, DocumentError> {
    let document = HtmlDocument::parse(html);
    let mut walker = SiteWalker::new(url, gateway, header);
    walker.walk(document.root())?;
    debug!(%url, counters = ?walker.counters(), modified = walker.is_modified(), "walked document");
    if walker.is_modified() {
        Ok(document.serialize())
    } else {
        Ok(html.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    };

    use markup5ever_rcdom::Handle;
    use n0_error::anyerr;

    use super::*;
    use crate::{
        error::RewriteError,
        rewrite::{Identity, Rewriter, from_fn},
    };

    const EMPTY_DOC: &str = "<html><head></head><body></body></html>";
    const URL: &str = "http://example.com";

    fn normalise(html: &str) -> String {
        HtmlDocument::parse(html).serialize()
    }

    fn rewrite(input: &str, rewriter: impl Rewriter, header: Option<&str>) -> String {
        let header = HeaderMaterial::new(header.map(ToOwned::to_owned), vec![]);
        rewrite_html(input, URL, &ScriptGateway::new(rewriter), &header).unwrap()
    }

    fn assert_rewrites(input: &str, expected: &str, rewriter: impl Rewriter, header: Option<&str>) {
        let actual = rewrite(input, rewriter, header);
        assert_eq!(normalise(&actual), normalise(expected));
    }

    fn bar() -> impl Rewriter {
        from_fn(|_, _| Ok("bar".into()))
    }

    fn crash() -> impl Rewriter {
        from_fn(|_, _| Err(RewriteError::failed(anyerr!("I crashed"))))
    }

    fn recording() -> (impl Rewriter, Arc<Mutex<Vec<RewriteMetadata>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let rewriter = from_fn({
            let seen = seen.clone();
            move |src, meta| {
                seen.lock().unwrap().push(meta.clone());
                Ok(src.into())
            }
        });
        (rewriter, seen)
    }

    fn find(node: &Handle, tag: &str) -> Option<Handle> {
        if node.is_element(tag) {
            return Some(node.clone());
        }
        node.children().iter().find_map(|child| find(child, tag))
    }

    #[test]
    fn identity_leaves_document_untouched() {
        assert_eq!(rewrite(EMPTY_DOC, Identity, None), EMPTY_DOC);
        let page = r#"<!DOCTYPE html><html><head><script>a()</script></head><body onload="b()"><a href="javascript:c()">x</a></body></html>"#;
        assert_eq!(rewrite(page, Identity, None), page);
    }

    #[test]
    fn inserts_header_script() {
        let expected = r#"<html><head><script>alert("hi");</script></head><body></body></html>"#;
        let actual = rewrite(EMPTY_DOC, Identity, Some(r#"alert("hi");"#));
        assert_eq!(actual, expected);
    }

    #[test]
    fn header_script_is_not_rewritten() {
        let expected = r#"<html><head><script>alert("hi");</script></head><body></body></html>"#;
        assert_eq!(rewrite(EMPTY_DOC, bar(), Some(r#"alert("hi");"#)), expected);
        assert_eq!(rewrite(EMPTY_DOC, crash(), Some(r#"alert("hi");"#)), expected);
    }

    #[test]
    fn existing_head_scripts_are_rewritten_after_header() {
        assert_rewrites(
            "<html><head><script>foo</script></head><body></body></html>",
            "<html><head><script>X</script><script>bar</script></head><body></body></html>",
            bar(),
            Some("X"),
        );
    }

    #[test]
    fn encodes_attribute_values() {
        let input = r#"<html><head></head><body><button onclick="foo()">Hello</button></body></html>"#;
        let rewriter = from_fn(|src, _| Ok(format!("if (x < y) {src}").into()));
        let actual = rewrite(input, rewriter, None);
        assert_eq!(
            actual,
            r#"<html><head></head><body><button onclick="if (x &lt; y) foo()">Hello</button></body></html>"#
        );
        let button = find(HtmlDocument::parse(&actual).root(), "button").unwrap();
        assert_eq!(button.attribute("onclick").as_deref(), Some("if (x < y) foo()"));
    }

    #[test]
    fn crashing_rewriter_leaves_document_byte_identical() {
        let input = r#"<html><head></head><body><button onclick="foo()">Hello</button><script>bar()</script><a href="javascript:baz()"></a></body></html>"#;
        assert_eq!(rewrite(input, crash(), None), input);
        let panicking = from_fn(|_, _| panic!("I crashed"));
        assert_eq!(rewrite(input, panicking, None), input);
    }

    #[test]
    fn rewrites_javascript_scripts() {
        for script in [
            "<script>foo</script>",
            r#"<script foo="bar">foo</script>"#,
            r#"<script type="javascript">foo</script>"#,
            r#"<script type="text/javascript">foo</script>"#,
            r#"<script type="text/JAVAscript">foo</script>"#,
        ] {
            let input = format!("<html><head></head>{script}<body></body></html>");
            let expected = input.replace(">foo<", ">bar<");
            assert_rewrites(&input, &expected, bar(), None);
        }
    }

    #[test]
    fn skips_non_javascript_and_empty_scripts() {
        let vbscript = r#"<html><head></head><script type="vbscript">foo</script><body></body></html>"#;
        assert_eq!(rewrite(vbscript, bar(), None), vbscript);
        let empty = "<html><head></head><script></script><body></body></html>";
        assert_eq!(rewrite(empty, bar(), None), empty);
    }

    #[test]
    fn external_scripts_never_reach_rewriter() {
        let called = Arc::new(AtomicBool::new(false));
        let rewriter = from_fn({
            let called = called.clone();
            move |src, _| {
                called.store(true, Ordering::SeqCst);
                Ok(src.into())
            }
        });
        let input = r#"<html><head></head><script src="foo.js"></script><body></body></html>"#;
        rewrite(input, rewriter, None);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn rewrites_event_handlers() {
        assert_rewrites(
            r#"<html><head></head><body onload="foo"></body></html>"#,
            r#"<html><head></head><body onload="bar"></body></html>"#,
            bar(),
            None,
        );
    }

    #[test]
    fn rewrites_javascript_urls_keeping_scheme() {
        assert_rewrites(
            r#"<html><head></head><body><a href="javascript:foo"></a></body></html>"#,
            r#"<html><head></head><body><a href="javascript:bar"></a></body></html>"#,
            bar(),
            None,
        );
        assert_rewrites(
            r#"<form action="JavaScript:foo"></form>"#,
            r#"<form action="JavaScript:bar"></form>"#,
            bar(),
            None,
        );
        let plain = r#"<html><head></head><body><a href="http://foo">x</a></body></html>"#;
        assert_eq!(rewrite(plain, bar(), None), plain);
    }

    #[test]
    fn synthetic_identifiers_follow_document_order() {
        let (rewriter, seen) = recording();
        rewrite(
            "<script>a</script><script>b</script><p><script>c</script></p>",
            rewriter,
            None,
        );
        let urls: Vec<_> = seen.lock().unwrap().iter().map(|m| m.url.clone()).collect();
        assert_eq!(
            urls,
            vec![
                "http://example.com#inline-0",
                "http://example.com#inline-1",
                "http://example.com#inline-2"
            ]
        );
    }

    #[test]
    fn rewrites_sites_inside_templates() {
        let input = concat!(
            "<html><head></head><body><template>",
            r#"<script>foo</script><button onclick="foo">x</button><a href="javascript:foo">y</a>"#,
            "</template></body></html>"
        );
        let actual = rewrite(input, bar(), None);
        assert!(actual.contains("<template><script>bar</script>"), "{actual}");
        assert!(actual.contains(r#"<button onclick="bar">x</button>"#), "{actual}");
        assert!(actual.contains(r#"<a href="javascript:bar">y</a>"#), "{actual}");
    }

    #[test]
    fn counters_are_independent_per_kind() {
        let (rewriter, seen) = recording();
        rewrite(
            r#"<a onclick="a" onmouseover="b" href="javascript:c"></a><script>d</script><img src="javascript:e" onerror="f">"#,
            rewriter,
            None,
        );
        let seen: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|m| (m.kind, m.url.trim_start_matches(URL).to_string(), m.inline))
            .collect();
        assert_eq!(
            seen,
            vec![
                (SiteKind::EventHandler, "#event-handler-0".to_string(), true),
                (SiteKind::EventHandler, "#event-handler-1".to_string(), true),
                (SiteKind::JavascriptUrl, "#js-url-0".to_string(), true),
                (SiteKind::Script, "#inline-0".to_string(), true),
                (SiteKind::EventHandler, "#event-handler-2".to_string(), true),
                (SiteKind::JavascriptUrl, "#js-url-1".to_string(), true),
            ]
        );
    }

    #[test]
    fn counters_restart_for_every_document() {
        let gateway = ScriptGateway::new(Identity);
        let header = HeaderMaterial::default();
        for _ in 0..2 {
            let doc = HtmlDocument::parse("<script>a</script><button onclick=\"b\">");
            let mut walker = SiteWalker::new(URL, &gateway, &header);
            walker.walk(doc.root()).unwrap();
            assert_eq!(
                walker.counters(),
                &SiteCounters {
                    inline: 1,
                    event_handler: 1,
                    js_url: 0
                }
            );
        }
    }

    #[test]
    fn element_inside_script_is_a_structure_error() {
        let doc = HtmlDocument::parse(EMPTY_DOC);
        let script = Handle::new_element("script", &[], None);
        script.prepend_children(vec![Handle::new_element("b", &[], Some("x"))]);
        find(doc.root(), "body").unwrap().prepend_children(vec![script]);

        let gateway = ScriptGateway::new(Identity);
        let header = HeaderMaterial::default();
        let err = SiteWalker::new(URL, &gateway, &header)
            .walk(doc.root())
            .unwrap_err();
        assert!(matches!(
            err,
            DocumentError::UnexpectedScriptChild {
                kind: NodeKind::Element,
                ..
            }
        ));
    }

    #[test]
    fn script_type_detection() {
        assert!(is_javascript_type(None));
        assert!(is_javascript_type(Some(String::new())));
        assert!(is_javascript_type(Some("application/x-JavaScript".into())));
        assert!(!is_javascript_type(Some("module".into())));
        assert!(!is_javascript_type(Some("text/template".into())));
    }
}
