use http::StatusCode;
use n0_error::{AnyError, e, stack_error};

use crate::dom::NodeKind;

/// Errors a [`Rewriter`](crate::Rewriter) may report for a single script.
///
/// None of these ever reach the client: the gateway logs them and serves the
/// original source instead.
#[stack_error(add_meta, derive)]
#[non_exhaustive]
pub enum RewriteError {
    /// The script source could not be parsed.
    #[error("failed to parse script source")]
    Parse {
        #[error(source)]
        source: AnyError,
    },
    /// The rewrite callback failed.
    #[error("rewriter failed")]
    Failed {
        #[error(source)]
        source: AnyError,
    },
    /// A structured result could not be turned back into source text.
    #[error("failed to generate source from rewritten script")]
    Generate {
        #[error(source)]
        source: AnyError,
    },
}

impl RewriteError {
    /// Creates a [`RewriteError::Parse`].
    #[track_caller]
    pub fn parse(source: impl Into<AnyError>) -> Self {
        e!(RewriteError::Parse, source.into())
    }

    /// Creates a [`RewriteError::Failed`].
    #[track_caller]
    pub fn failed(source: impl Into<AnyError>) -> Self {
        e!(RewriteError::Failed, source.into())
    }

    /// Creates a [`RewriteError::Generate`].
    #[track_caller]
    pub fn generate(source: impl Into<AnyError>) -> Self {
        e!(RewriteError::Generate, source.into())
    }

    /// Returns `true` if the script could not be parsed.
    pub fn is_parse(&self) -> bool {
        matches!(self, RewriteError::Parse { .. })
    }
}

/// Structural problems that abort rewriting of a whole document.
#[stack_error(add_meta, derive)]
#[non_exhaustive]
pub enum DocumentError {
    /// A `<script>` element holds a child that is neither text nor a comment.
    #[error("unexpected {kind:?} node inside <script> element")]
    UnexpectedScriptChild { kind: NodeKind },
}

/// Error from handling a single proxied exchange.
#[stack_error(add_meta, derive)]
pub struct ProxyError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl From<std::io::Error> for ProxyError {
    fn from(value: std::io::Error) -> Self {
        Self::io(value)
    }
}

impl ProxyError {
    /// Returns the HTTP status code to surface to the client, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    pub(crate) fn bad_request(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_REQUEST), source.into())
    }

    pub(crate) fn bad_gateway(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_GATEWAY), source.into())
    }

    pub(crate) fn io(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }
}
