use std::{convert::Infallible, io};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, StreamBody, combinators::UnsyncBoxBody};
use hyper::body::Frame;
use n0_error::{Result, StackResultExt};
use n0_future::{Stream, stream::StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Body type of every response the proxy writes to its clients.
pub(crate) type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(infallible_to_io)
        .boxed_unsync()
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::new().map_err(infallible_to_io).boxed_unsync()
}

/// Wraps a stream of chunks into a response body, preserving chunk order.
pub(crate) fn stream_body(
    stream: impl Stream<Item = io::Result<Bytes>> + Send + 'static,
) -> ProxyBody {
    StreamBody::new(stream.map(|chunk| chunk.map(Frame::data))).boxed_unsync()
}

fn infallible_to_io(err: Infallible) -> io::Error {
    match err {}
}

/// Bidirectionally forward data between two reader/writer pairs.
///
/// Shuts down each writer once its reader reaches EOF.
pub(crate) async fn forward_bidi(
    downstream_recv: &mut (impl AsyncRead + Send + Unpin),
    downstream_send: &mut (impl AsyncWrite + Send + Unpin),
    upstream_recv: &mut (impl AsyncRead + Send + Unpin),
    upstream_send: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<(u64, u64)> {
    let start = std::time::Instant::now();
    let (r1, r2) = tokio::join!(
        async {
            let res = tokio::io::copy(downstream_recv, upstream_send).await;
            upstream_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "forward down-to-up finished");
            res
        },
        async {
            let res = tokio::io::copy(upstream_recv, downstream_send).await;
            downstream_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "forward up-to-down finished");
            res
        }
    );
    let r1 = r1.context("failed to copy down-to-up")?;
    let r2 = r2.context("failed to copy up-to-down")?;
    Ok((r1, r2))
}
