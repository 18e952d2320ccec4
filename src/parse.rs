use http::{
    HeaderMap, HeaderName,
    header::{CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE},
    uri::{Scheme, Uri},
};
use n0_error::{Result, StackResultExt, anyerr, ensure_any};

/// Hop-by-hop headers per RFC 9110, plus the legacy `Keep-Alive` and `Proxy-Connection`.
const HOP_BY_HOP_HEADERS: &[&str] = &["keep-alive", "proxy-connection"];

/// Host and port authority parsed from HTTP request targets.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl Authority {
    /// Parses an authority-form URI with no scheme and no path, as sent with `CONNECT`.
    ///
    /// Note: the URI must include a port.
    pub fn from_authority_uri(uri: &Uri) -> Result<Self> {
        ensure_any!(uri.scheme().is_none(), "Expected URI without scheme");
        ensure_any!(uri.path_and_query().is_none(), "Expected URI without path");
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = authority.port_u16().context("Expected URI with port")?;
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    /// Parses an absolute-form URI and infers the port from the scheme.
    ///
    /// Note: if no port is present, only `http` and `https` schemes are accepted.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => Err(anyerr!("Expected URI with port or http(s) scheme"))?,
            },
        };
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    pub(crate) fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Removes hop-by-hop headers, including any header listed in `Connection`.
///
/// Each leg of a proxied exchange is framed independently, so these must not
/// be forwarded.
pub fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE] {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn authority_form() {
        let authority = Authority::from_authority_uri(&uri("example.com:443")).unwrap();
        assert_eq!(authority.to_string(), "example.com:443");
        assert!(Authority::from_authority_uri(&uri("example.com")).is_err());
        assert!(Authority::from_authority_uri(&uri("http://example.com:80")).is_err());
    }

    #[test]
    fn absolute_form_infers_port() {
        let http = Authority::from_absolute_uri(&uri("http://example.com/a.js")).unwrap();
        assert_eq!(http.to_addr(), "example.com:80");
        let https = Authority::from_absolute_uri(&uri("https://example.com")).unwrap();
        assert_eq!(https.port, 443);
        let explicit = Authority::from_absolute_uri(&uri("http://127.0.0.1:8081/")).unwrap();
        assert_eq!(explicit.to_addr(), "127.0.0.1:8081");
        assert!(Authority::from_absolute_uri(&uri("/origin/form")).is_err());
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        filter_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }
}
