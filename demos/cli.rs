use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use n0_error::{Result, StdResultExt};
use regex::Regex;
use rewriting_proxy::{
    DEFAULT_MAX_BODY_LEN, DEFAULT_PORT, Identity, ProxyOpts, RewritingProxy, StaticScripts,
    rewrite,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RewriterKind {
    /// Serve every script unchanged.
    Identity,
    /// Log every script site and serve it unchanged.
    Log,
    /// Prepend `--prefix` to every script.
    Prefix,
}

/// Forward HTTP proxy that rewrites the JavaScript passing through it.
#[derive(Parser)]
struct Cli {
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Script text injected at the top of every document's `<head>`.
    #[clap(long)]
    header_html: Option<String>,
    /// Script URL injected at the top of every document's `<head>`.
    #[clap(long = "header-url")]
    header_urls: Vec<String>,
    /// Request URLs matching this pattern are never rewritten.
    #[clap(long)]
    no_instrument: Option<Regex>,
    /// Serve the contents of FILE for requests to URL, as `URL=FILE`.
    #[clap(long = "intercept", value_parser = parse_intercept)]
    intercepts: Vec<(String, PathBuf)>,
    #[clap(long, value_enum, default_value_t = RewriterKind::Log)]
    rewriter: RewriterKind,
    /// Code prepended by the `prefix` rewriter.
    #[clap(long, default_value = "/* rewritten */")]
    prefix: String,
    /// Largest response body buffered for rewriting.
    #[clap(long, default_value_t = DEFAULT_MAX_BODY_LEN)]
    max_body_len: usize,
    /// Serve the original response if rewriting takes longer than this.
    #[clap(long)]
    rewrite_timeout_ms: Option<u64>,
}

fn parse_intercept(s: &str) -> Result<(String, PathBuf), String> {
    let (url, file) = s
        .split_once('=')
        .ok_or_else(|| format!("expected URL=FILE, got {s:?}"))?;
    Ok((url.to_string(), PathBuf::from(file)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let mut opts = match cli.rewriter {
        RewriterKind::Identity => ProxyOpts::new(Identity),
        RewriterKind::Log => ProxyOpts::new(rewrite::from_fn(|source, meta| {
            info!(
                url = %meta.url,
                kind = %meta.kind,
                inline = meta.inline,
                len = source.len(),
                "script"
            );
            Ok(source.into())
        })),
        RewriterKind::Prefix => {
            let prefix = cli.prefix;
            ProxyOpts::new(rewrite::from_fn(move |source, _meta| {
                Ok(format!("{prefix}{source}").into())
            }))
        }
    };
    if let Some(html) = cli.header_html {
        opts = opts.header_html(html);
    }
    opts = opts
        .header_urls(cli.header_urls)
        .max_body_len(cli.max_body_len);
    if let Some(pattern) = cli.no_instrument {
        opts = opts.no_instrument(pattern);
    }
    if let Some(ms) = cli.rewrite_timeout_ms {
        opts = opts.rewrite_timeout(Duration::from_millis(ms));
    }
    if !cli.intercepts.is_empty() {
        let mut scripts = StaticScripts::default();
        for (url, file) in cli.intercepts {
            let script = tokio::fs::read_to_string(&file)
                .await
                .std_context("Failed to read intercept script")?;
            scripts = scripts.insert(url, script);
        }
        opts = opts.intercept(scripts);
    }

    let proxy = RewritingProxy::new(opts)?;
    let listener = RewritingProxy::bind(cli.port).await?;
    println!("rewriting proxy listening on {}", listener.local_addr()?);
    tokio::select! {
        res = proxy.forward_tcp_listener(listener) => res?,
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}
