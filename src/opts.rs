use std::{sync::Arc, time::Duration};

use regex::Regex;

use crate::{
    header::HeaderMaterial,
    intercept::{DynIntercept, Intercept},
    rewrite::{Rewriter, ScriptGateway},
};

/// Port the proxy listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8080;

/// Largest JavaScript or HTML body buffered for rewriting by default.
pub const DEFAULT_MAX_BODY_LEN: usize = 32 * 1024 * 1024;

/// Configuration shared read-only by every exchange.
///
/// ```ignore
/// let opts = ProxyOpts::new(rewrite::from_fn(|src, _meta| Ok(format!("trace();{src}").into())))
///     .header_html("window.__traced = true;")
///     .no_instrument(Regex::new(r"^https?://cdn\.")?);
/// ```
#[derive(derive_more::Debug, Clone)]
pub struct ProxyOpts {
    pub(crate) gateway: Arc<ScriptGateway>,
    pub(crate) header: Arc<HeaderMaterial>,
    pub(crate) no_instrument: Option<Regex>,
    #[debug("{:?}", intercept.as_ref().map(|_| "DynIntercept"))]
    pub(crate) intercept: Option<Arc<DynIntercept<'static>>>,
    pub(crate) max_body_len: usize,
    pub(crate) rewrite_timeout: Option<Duration>,
}

impl ProxyOpts {
    /// Creates options that route every script through `rewriter`.
    pub fn new(rewriter: impl Rewriter) -> Self {
        Self {
            gateway: Arc::new(ScriptGateway::new(rewriter)),
            header: Default::default(),
            no_instrument: None,
            intercept: None,
            max_body_len: DEFAULT_MAX_BODY_LEN,
            rewrite_timeout: None,
        }
    }

    /// Sets the script text injected as an inline `<script>` at the top of every `<head>`.
    pub fn header_html(mut self, html: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.header).html = Some(html.into());
        self
    }

    /// Sets the script URLs injected as `<script src>` elements at the top of every `<head>`.
    pub fn header_urls(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Arc::make_mut(&mut self.header).urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Exempts request URLs matching `pattern` from rewriting.
    pub fn no_instrument(mut self, pattern: Regex) -> Self {
        self.no_instrument = Some(pattern);
        self
    }

    /// Sets the interceptor consulted before contacting the origin.
    pub fn intercept(mut self, intercept: impl Intercept + 'static) -> Self {
        self.intercept = Some(DynIntercept::new_arc(intercept));
        self
    }

    /// Sets the largest body buffered for rewriting.
    ///
    /// Larger responses are relayed unmodified.
    pub fn max_body_len(mut self, len: usize) -> Self {
        self.max_body_len = len;
        self
    }

    /// Limits how long rewriting a single response may take.
    ///
    /// When exceeded, the original response is served.
    pub fn rewrite_timeout(mut self, timeout: Duration) -> Self {
        self.rewrite_timeout = Some(timeout);
        self
    }

    /// Returns the gateway all scripts are routed through.
    pub fn gateway(&self) -> &ScriptGateway {
        &self.gateway
    }

    /// Returns `true` if `url` is exempt from rewriting.
    pub(crate) fn is_bypassed(&self, url: &str) -> bool {
        self.no_instrument
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(url))
    }
}
