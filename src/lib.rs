//! HTTP forward proxy that rewrites the JavaScript passing through it.
//!
//! Every script a browser would execute is handed to a [`Rewriter`] before it
//! reaches the client: whole JavaScript responses, inline `<script>` elements,
//! event-handler attributes and `javascript:` URLs inside HTML documents.
//! Operator-provided scripts can be injected at the top of every `<head>`, and
//! selected URLs can be served from an [`Intercept`] without contacting the
//! origin. Rewriting never breaks a page: on any failure the original bytes
//! are served.
//!
//! ```ignore
//! let opts = ProxyOpts::new(rewrite::from_fn(|source, meta| {
//!     Ok(format!("__trace({:?});{source}", meta.url).into())
//! }));
//! let proxy = RewritingProxy::new(opts)?;
//! proxy.forward_tcp_listener(RewritingProxy::bind(DEFAULT_PORT).await?).await?;
//! ```

mod classify;
pub mod dom;
mod error;
mod header;
pub mod intercept;
mod opts;
mod parse;
mod proxy;
pub mod rewrite;
mod util;
mod walk;

pub use {
    classify::{Classification, classify},
    error::{DocumentError, ProxyError, RewriteError},
    header::HeaderMaterial,
    intercept::{Intercept, StaticScripts},
    opts::{DEFAULT_MAX_BODY_LEN, DEFAULT_PORT, ProxyOpts},
    parse::{Authority, filter_hop_by_hop_headers},
    proxy::{ExchangeState, RewritingProxy},
    rewrite::{
        GenerateSource, Identity, RewriteMetadata, Rewriter, Rewritten, ScriptGateway, SiteKind,
    },
    walk::{SiteCounters, SiteWalker, rewrite_html},
};
