use std::{convert::Infallible, io, net::Ipv4Addr, sync::Arc};

use bytes::{Bytes, BytesMut};
use http::{
    HeaderMap, HeaderValue, Method, StatusCode,
    header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE},
};
use http_body_util::BodyDataStream;
use hyper::{
    Request, Response,
    body::{Body, Incoming},
    server::conn::http1,
    service::service_fn,
    upgrade::OnUpgrade,
};
use hyper_util::rt::TokioIo;
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use n0_future::stream::{self, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    classify::{Classification, classify},
    error::{DocumentError, ProxyError},
    intercept::Intercept,
    opts::ProxyOpts,
    parse::{Authority, filter_hop_by_hop_headers},
    util::{ProxyBody, empty_body, forward_bidi, full_body, stream_body},
    walk::rewrite_html,
};

/// Forward HTTP proxy that rewrites the JavaScript it relays.
///
/// Every response is classified by its `Content-Type` and request path.
/// JavaScript responses are passed whole through the configured rewriter,
/// HTML documents have each script site rewritten in place, and everything
/// else is streamed through untouched. Any failure to rewrite falls back to
/// serving the original response bytes.
#[derive(Debug, Clone)]
pub struct RewritingProxy {
    opts: Arc<ProxyOpts>,
    client: reqwest::Client,
}

impl RewritingProxy {
    /// Creates a proxy with the given options.
    pub fn new(opts: ProxyOpts) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .std_context("Failed to build upstream HTTP client")?;
        Ok(Self {
            opts: Arc::new(opts),
            client,
        })
    }

    /// Returns the options this proxy was created with.
    pub fn opts(&self) -> &ProxyOpts {
        &self.opts
    }

    /// Binds a listener on all interfaces at `port`.
    pub async fn bind(port: u16) -> Result<TcpListener> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        Ok(listener)
    }

    /// Accepts TCP connections from the listener and serves each in a new task.
    ///
    /// Runs until the listener errors or the future is dropped, which also
    /// cancels all connection tasks.
    pub async fn forward_tcp_listener(&self, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut id = 0;
        loop {
            let (client_stream, client_addr) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted TCP connection");
                        if let Err(err) = this.serve_connection(client_stream).await {
                            warn!("Failed to handle TCP connection: {err:#}");
                        }
                    })
                    .instrument(error_span!("conn", id)),
            );
            id += 1;
        }
    }

    async fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(|req| {
            let this = self.clone();
            async move {
                let res = match this.handle_request(req).await {
                    Ok(res) => res,
                    Err(err) => {
                        warn!("Error while proxying request: {err:#}");
                        let status = err.response_status().unwrap_or(StatusCode::BAD_GATEWAY);
                        error_response(status)
                    }
                };
                Ok::<_, Infallible>(res)
            }
        });
        http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .anyerr()?;
        Ok(())
    }

    async fn handle_request(
        &self,
        mut request: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let url = request.uri().to_string();
        let mut exchange = Exchange::new(&url);
        debug!(method = %request.method(), %url, "incoming request");

        if let Some(script) = self.intercepted(&url).await {
            exchange.advance(ExchangeState::Intercepted);
            debug!(%url, len = script.len(), "serving intercepted script");
            exchange.advance(ExchangeState::Responding);
            return Ok(script_response(script));
        }

        if request.method() == Method::CONNECT {
            let authority =
                Authority::from_authority_uri(request.uri()).map_err(ProxyError::bad_request)?;
            exchange.advance(ExchangeState::Forwarding);
            let origin = TcpStream::connect(authority.to_addr())
                .await
                .inspect_err(|_| exchange.advance(ExchangeState::Failed))
                .map_err(|err| ProxyError::bad_gateway(anyerr!(err)))?;
            debug!(%authority, "tunnel: connected to origin");
            let upgrade = hyper::upgrade::on(&mut request);
            tokio::spawn(
                async move {
                    if let Err(err) = forward_upgrade(upgrade, origin).await {
                        warn!("Tunnel failed: {err:#}");
                    }
                }
                .instrument(tracing::Span::current()),
            );
            exchange.advance(ExchangeState::Responding);
            return Ok(Response::new(empty_body()));
        }

        let authority =
            Authority::from_absolute_uri(request.uri()).map_err(ProxyError::bad_request)?;
        debug!(%authority, "forwarding to origin");

        let (parts, body) = request.into_parts();
        let head_only = parts.method == Method::HEAD;
        let mut headers = parts.headers;
        filter_hop_by_hop_headers(&mut headers);
        headers.remove(ACCEPT_ENCODING);

        let mut upstream = self
            .client
            .request(parts.method, url.as_str())
            .headers(headers);
        if !body.is_end_stream() {
            upstream = upstream.body(reqwest::Body::wrap_stream(BodyDataStream::new(body)));
        }

        exchange.advance(ExchangeState::Forwarding);
        let mut response = match upstream.send().await {
            Ok(response) => response,
            Err(err) => {
                exchange.advance(ExchangeState::Failed);
                warn!(%authority, "origin unreachable: {err:#}");
                return Err(ProxyError::bad_gateway(anyerr!(err)));
            }
        };
        let status = response.status();
        let mut headers = std::mem::take(response.headers_mut());
        filter_hop_by_hop_headers(&mut headers);
        debug!(%status, ?headers, "response from origin");

        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        let classification = classify(
            content_type,
            parts.uri.path(),
            self.opts.is_bypassed(&url),
        );
        exchange.advance(ExchangeState::Classified);
        debug!(%url, %classification, "classified response");

        let mut body = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(io::Error::other)),
        );
        if !classification.needs_buffering()
            || head_only
            || matches!(status, StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED)
            || is_encoded(&headers)
        {
            exchange.advance(ExchangeState::Responding);
            return Ok(build_response(status, headers, stream_body(body)));
        }

        exchange.advance(ExchangeState::BufferingResponse);
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.inspect_err(|_| exchange.advance(ExchangeState::Failed))?;
            if buffer.len() + chunk.len() > self.opts.max_body_len {
                debug!(%url, limit = self.opts.max_body_len, "response too large to rewrite");
                exchange.advance(ExchangeState::Responding);
                let prefix = stream::iter([Ok(buffer.freeze()), Ok(chunk)]);
                return Ok(build_response(status, headers, stream_body(prefix.chain(body))));
            }
            buffer.extend_from_slice(&chunk);
        }
        let original = buffer.freeze();

        exchange.advance(ExchangeState::Rewriting);
        let body = match self.rewrite_body(classification, &url, original.clone()).await {
            Ok(Some(rewritten)) => Bytes::from(rewritten),
            Ok(None) => original,
            Err(err) => {
                exchange.advance(ExchangeState::Failed);
                warn!(%url, "serving original response: {err:#}");
                original
            }
        };
        exchange.advance(ExchangeState::Responding);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Ok(build_response(status, headers, full_body(body)))
    }

    async fn intercepted(&self, url: &str) -> Option<String> {
        let intercept = self.opts.intercept.as_ref()?;
        intercept
            .intercept(url)
            .await
            .filter(|script| !script.is_empty())
    }

    /// Rewrites a buffered body off the async runtime.
    ///
    /// Returns `None` if rewriting left the body unchanged.
    async fn rewrite_body(
        &self,
        classification: Classification,
        url: &str,
        original: Bytes,
    ) -> Result<Option<String>> {
        let gateway = self.opts.gateway.clone();
        let header = self.opts.header.clone();
        let url = url.to_string();
        let task = tokio::task::spawn_blocking(move || -> Result<Option<String>, DocumentError> {
            let source = String::from_utf8_lossy(&original);
            let rewritten = match classification {
                Classification::JavaScript => gateway.rewrite_external(&source, &url),
                Classification::Html => rewrite_html(&source, &url, &gateway, &header)?,
                Classification::Other => return Ok(None),
            };
            Ok((rewritten != source).then_some(rewritten))
        });
        let joined = match self.opts.rewrite_timeout {
            Some(timeout) => tokio::time::timeout(timeout, task)
                .await
                .std_context("Rewriting timed out")?,
            None => task.await,
        };
        let rewritten = joined
            .std_context("Rewrite task failed")?
            .context("Failed to rewrite document")?;
        Ok(rewritten)
    }
}

/// Lifecycle of a single proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ExchangeState {
    Received,
    Intercepted,
    Forwarding,
    BufferingResponse,
    Classified,
    Rewriting,
    Responding,
    Failed,
}

struct Exchange<'a> {
    url: &'a str,
    state: ExchangeState,
}

impl<'a> Exchange<'a> {
    fn new(url: &'a str) -> Self {
        Self {
            url,
            state: ExchangeState::Received,
        }
    }

    fn advance(&mut self, next: ExchangeState) {
        trace!(url = %self.url, from = %self.state, to = %next, "exchange state");
        self.state = next;
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        trace!(url = %self.url, state = %self.state, "exchange closed");
    }
}

async fn forward_upgrade(upgrade: OnUpgrade, mut origin: TcpStream) -> Result<()> {
    let upgraded = upgrade.await.std_context("HTTP/1 upgrade failed")?;
    let (mut client_recv, mut client_send) = tokio::io::split(TokioIo::new(upgraded));
    let (mut origin_recv, mut origin_send) = origin.split();
    let (to_origin, from_origin) = forward_bidi(
        &mut client_recv,
        &mut client_send,
        &mut origin_recv,
        &mut origin_send,
    )
    .await?;
    debug!(to_origin, from_origin, "tunnel finished");
    Ok(())
}

/// Returns `true` if the body carries a content coding other than `identity`.
fn is_encoded(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case("identity"))
}

fn build_response(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn script_response(script: String) -> Response<ProxyBody> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/javascript"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(script.len()));
    build_response(StatusCode::OK, headers, full_body(script))
}

fn error_response(status: StatusCode) -> Response<ProxyBody> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0usize));
    build_response(status, headers, empty_body())
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[test]
    fn content_codings() {
        let mut headers = HeaderMap::new();
        assert!(!is_encoded(&headers));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        assert!(!is_encoded(&headers));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(is_encoded(&headers));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("Identity, br"));
        assert!(is_encoded(&headers));
    }

    #[tokio::test]
    async fn intercepted_scripts_are_framed() {
        let response = script_response("hook();".to_string());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            HeaderValue::from_static("application/javascript")
        );
        assert_eq!(response.headers()[CONTENT_LENGTH], HeaderValue::from(7usize));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("hook();"));
    }

    #[tokio::test]
    async fn error_responses_are_empty() {
        let response = error_response(StatusCode::BAD_GATEWAY);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }
}
