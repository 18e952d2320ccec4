use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::atomic::{AtomicU64, Ordering},
};

use n0_error::{AnyError, anyerr};
use tracing::{debug, warn};

use crate::error::RewriteError;

/// Case-insensitive scheme that makes a URL execute its remainder as script.
pub const JAVASCRIPT_SCHEME: &str = "javascript:";

/// Kind of script site handed to a [`Rewriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum SiteKind {
    /// A whole script: an external script response or an inline `<script>` body.
    #[display("script")]
    Script,
    /// The value of an event handler attribute such as `onclick`.
    #[display("event-handler")]
    EventHandler,
    /// The payload of a `javascript:` URL in a URL-bearing attribute.
    #[display("javascript-url")]
    JavascriptUrl,
}

/// Information about the script being rewritten.
///
/// `url` is the response URL for whole-response scripts and a synthetic
/// identifier such as `http://example.com/#inline-0` for sites inside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteMetadata {
    pub kind: SiteKind,
    pub url: String,
    /// `false` only for scripts fetched as their own response.
    pub inline: bool,
    /// Full original source, set for whole-response scripts only.
    pub source: Option<String>,
}

impl RewriteMetadata {
    /// Metadata for a script served as its own response.
    pub fn external_script(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: SiteKind::Script,
            url: url.into(),
            inline: false,
            source: Some(source.into()),
        }
    }

    /// Metadata for a script site inside a document.
    pub fn in_document(kind: SiteKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            inline: true,
            source: None,
        }
    }
}

/// Turns a structured rewrite result back into source text.
pub trait GenerateSource: Send {
    fn generate(self: Box<Self>) -> Result<String, RewriteError>;
}

/// Output of a [`Rewriter`].
#[derive(derive_more::Debug)]
pub enum Rewritten {
    /// Final source text.
    Source(String),
    /// A structured result that still has to be turned into source text.
    #[debug("Generated(..)")]
    Generated(Box<dyn GenerateSource>),
}

impl From<String> for Rewritten {
    fn from(value: String) -> Self {
        Self::Source(value)
    }
}

impl From<&str> for Rewritten {
    fn from(value: &str) -> Self {
        Self::Source(value.to_string())
    }
}

impl Rewritten {
    fn into_source(self) -> Result<String, RewriteError> {
        match self {
            Rewritten::Source(source) => Ok(source),
            Rewritten::Generated(generator) => generator.generate(),
        }
    }
}

/// Transforms script source.
///
/// Called synchronously, possibly from many threads at once. Implementations
/// should return promptly; the proxy runs them off the async executor.
pub trait Rewriter: Send + Sync + 'static {
    fn rewrite(&self, source: &str, metadata: &RewriteMetadata) -> Result<Rewritten, RewriteError>;
}

/// Creates a [`Rewriter`] from a closure.
pub fn from_fn<F>(f: F) -> RewriteFn<F>
where
    F: Fn(&str, &RewriteMetadata) -> Result<Rewritten, RewriteError> + Send + Sync + 'static,
{
    RewriteFn(f)
}

/// Rewriter returned by [`from_fn`].
#[derive(Clone)]
pub struct RewriteFn<F>(F);

impl<F> Rewriter for RewriteFn<F>
where
    F: Fn(&str, &RewriteMetadata) -> Result<Rewritten, RewriteError> + Send + Sync + 'static,
{
    fn rewrite(&self, source: &str, metadata: &RewriteMetadata) -> Result<Rewritten, RewriteError> {
        (self.0)(source, metadata)
    }
}

/// Rewriter that returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Rewriter for Identity {
    fn rewrite(
        &self,
        source: &str,
        _metadata: &RewriteMetadata,
    ) -> Result<Rewritten, RewriteError> {
        Ok(Rewritten::Source(source.to_string()))
    }
}

/// Routes script sources through a [`Rewriter`] without ever failing.
///
/// A leading `javascript:` scheme is split off before the rewriter sees the
/// source and reattached, with its original casing, afterwards. If the
/// rewriter returns an error or panics, the original source is returned.
#[derive(derive_more::Debug)]
pub struct ScriptGateway {
    #[debug("Box<dyn Rewriter>")]
    rewriter: Box<dyn Rewriter>,
    unparseable: AtomicU64,
}

impl ScriptGateway {
    pub fn new(rewriter: impl Rewriter) -> Self {
        Self {
            rewriter: Box::new(rewriter),
            unparseable: AtomicU64::new(0),
        }
    }

    /// Number of whole-response scripts the rewriter could not parse so far.
    pub fn unparseable_count(&self) -> u64 {
        self.unparseable.load(Ordering::Relaxed)
    }

    /// Rewrites `source`, returning the original payload on any failure.
    pub fn rewrite(&self, source: &str, metadata: &RewriteMetadata) -> String {
        let (prefix, payload) = split_javascript_scheme(source);
        let rewritten = match self.invoke(payload, metadata) {
            Ok(rewritten) => {
                debug!(url = %metadata.url, kind = %metadata.kind, "rewrote script");
                rewritten
            }
            Err(err) => {
                if err.is_parse() && !metadata.inline {
                    let count = self.unparseable.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        url = %metadata.url,
                        unparseable = count,
                        "could not parse script, passing it on unrewritten: {err:#}"
                    );
                } else {
                    warn!(
                        url = %metadata.url,
                        kind = %metadata.kind,
                        "failed to rewrite script: {err:#}"
                    );
                }
                payload.to_string()
            }
        };
        format!("{prefix}{rewritten}")
    }

    /// Rewrites a script that was served as its own response.
    pub fn rewrite_external(&self, source: &str, url: &str) -> String {
        let metadata = RewriteMetadata::external_script(url, source);
        self.rewrite(source, &metadata)
    }

    fn invoke(&self, payload: &str, metadata: &RewriteMetadata) -> Result<String, RewriteError> {
        catch_unwind(AssertUnwindSafe(|| {
            self.rewriter.rewrite(payload, metadata)?.into_source()
        }))
        .unwrap_or_else(|panic| Err(RewriteError::failed(panic_message(panic))))
    }
}

/// Splits a leading case-insensitive `javascript:` scheme off `source`.
///
/// Returns the scheme exactly as written (possibly empty) and the remainder.
pub fn split_javascript_scheme(source: &str) -> (&str, &str) {
    match source.get(..JAVASCRIPT_SCHEME.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(JAVASCRIPT_SCHEME) => {
            source.split_at(JAVASCRIPT_SCHEME.len())
        }
        _ => ("", source),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> AnyError {
    match panic.downcast::<String>() {
        Ok(message) => anyerr!("rewriter panicked: {message}"),
        Err(panic) => match panic.downcast_ref::<&'static str>() {
            Some(message) => anyerr!("rewriter panicked: {message}"),
            None => anyerr!("rewriter panicked"),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn inline(kind: SiteKind) -> RewriteMetadata {
        RewriteMetadata::in_document(kind, "http://example.com/#x-0")
    }

    #[test]
    fn splits_scheme_preserving_case() {
        assert_eq!(split_javascript_scheme("JavaScript:foo()"), ("JavaScript:", "foo()"));
        assert_eq!(split_javascript_scheme("javascript:"), ("javascript:", ""));
        assert_eq!(split_javascript_scheme("foo()"), ("", "foo()"));
        assert_eq!(split_javascript_scheme("java"), ("", "java"));
        // Multi-byte characters around the boundary must not panic.
        assert_eq!(split_javascript_scheme("javascrip\u{e9}x"), ("", "javascrip\u{e9}x"));
    }

    #[test]
    fn scheme_is_not_passed_to_rewriter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gateway = ScriptGateway::new(from_fn({
            let seen = seen.clone();
            move |src, _| {
                seen.lock().unwrap().push(src.to_string());
                Ok("bar".into())
            }
        }));
        let out = gateway.rewrite("JAVASCRIPT:foo", &inline(SiteKind::JavascriptUrl));
        assert_eq!(out, "JAVASCRIPT:bar");
        assert_eq!(*seen.lock().unwrap(), vec!["foo".to_string()]);
    }

    #[test]
    fn error_returns_original_payload() {
        let gateway = ScriptGateway::new(from_fn(|_, _| {
            Err(RewriteError::failed(anyerr!("I crashed")))
        }));
        assert_eq!(gateway.rewrite("foo()", &inline(SiteKind::Script)), "foo()");
        assert_eq!(
            gateway.rewrite("javascript:foo()", &inline(SiteKind::JavascriptUrl)),
            "javascript:foo()"
        );
    }

    #[test]
    fn panic_returns_original_payload() {
        let gateway = ScriptGateway::new(from_fn(|_, _| panic!("I crashed")));
        assert_eq!(gateway.rewrite("foo()", &inline(SiteKind::EventHandler)), "foo()");
    }

    #[test]
    fn parse_failures_are_counted_for_external_scripts() {
        let gateway = ScriptGateway::new(from_fn(|_, _| {
            Err(RewriteError::parse(anyerr!("unexpected token")))
        }));
        assert_eq!(gateway.rewrite_external("}{", "http://example.com/a.js"), "}{");
        assert_eq!(gateway.rewrite_external("}{", "http://example.com/b.js"), "}{");
        gateway.rewrite("}{", &inline(SiteKind::Script));
        assert_eq!(gateway.unparseable_count(), 2);
    }

    #[test]
    fn external_metadata_carries_source() {
        let seen = Arc::new(Mutex::new(None));
        let gateway = ScriptGateway::new(from_fn({
            let seen = seen.clone();
            move |src, meta| {
                *seen.lock().unwrap() = Some(meta.clone());
                Ok(format!("/*x*/{src}").into())
            }
        }));
        let out = gateway.rewrite_external("foo()", "http://example.com/a.js");
        assert_eq!(out, "/*x*/foo()");
        let meta = seen.lock().unwrap().clone().unwrap();
        assert_eq!(meta, RewriteMetadata {
            kind: SiteKind::Script,
            url: "http://example.com/a.js".to_string(),
            inline: false,
            source: Some("foo()".to_string()),
        });
    }

    struct Upper(String);

    impl GenerateSource for Upper {
        fn generate(self: Box<Self>) -> Result<String, RewriteError> {
            Ok(self.0.to_uppercase())
        }
    }

    struct Broken;

    impl GenerateSource for Broken {
        fn generate(self: Box<Self>) -> Result<String, RewriteError> {
            Err(RewriteError::generate(anyerr!("no codegen")))
        }
    }

    #[test]
    fn generated_results_are_turned_into_source() {
        let gateway = ScriptGateway::new(from_fn(|src, _| {
            Ok(Rewritten::Generated(Box::new(Upper(src.to_string()))))
        }));
        assert_eq!(
            gateway.rewrite("javascript:foo", &inline(SiteKind::JavascriptUrl)),
            "javascript:FOO"
        );

        let gateway =
            ScriptGateway::new(from_fn(|_, _| Ok(Rewritten::Generated(Box::new(Broken)))));
        assert_eq!(gateway.rewrite("foo", &inline(SiteKind::Script)), "foo");
    }

    #[test]
    fn kinds_display_as_metadata_types() {
        assert_eq!(SiteKind::Script.to_string(), "script");
        assert_eq!(SiteKind::EventHandler.to_string(), "event-handler");
        assert_eq!(SiteKind::JavascriptUrl.to_string(), "javascript-url");
        let rewritten = Identity.rewrite("a", &inline(SiteKind::Script)).unwrap();
        assert_eq!(rewritten.into_source().unwrap(), "a");
    }
}
