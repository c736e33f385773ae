//! Downstream target resolution.
//!
//! The bridge forwards the URL it reconstructed from the public request; the
//! client names the real downstream host via `bridging-base-url` — a header
//! for HTTP, a query parameter for WebSockets. The transform overwrites the
//! host component with that value and (for WebSockets) removes the parameter
//! from the re-encoded query. Scheme, path and remaining query are preserved.
//!
//! The netloc is kept exactly as the client wrote it (`host` or `host:port`)
//! because the whitelist matches on the literal form.

use bridging_core::{Args, BridgingError, BridgingResult};
use url::Url;

/// A resolved downstream target plus the pieces the firewall matches on.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Full URL to dial.
    pub url: String,
    /// Literal `host[:port]` as supplied by the client.
    pub netloc: String,
    pub scheme: String,
    pub path: String,
}

/// Resolve an HTTP target: the host comes from the (case-insensitive)
/// `bridging-base-url` header; the query string is preserved verbatim.
pub fn transform_http_url(args: &Args) -> BridgingResult<Target> {
    let parsed = parse_args_url(args)?;
    let netloc = args
        .headers
        .as_ref()
        .and_then(|headers| {
            headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("bridging-base-url"))
                .and_then(|(_, values)| values.first())
        })
        .ok_or_else(|| BridgingError::InvalidPacket("missing bridging-base-url header".into()))?
        .clone();

    Ok(rebuild(&parsed, netloc, parsed.query().map(str::to_string)))
}

/// Resolve a WebSocket target: the host comes from the `bridging-base-url`
/// query parameter, which is removed from the re-encoded query string.
pub fn transform_ws_url(args: &Args) -> BridgingResult<Target> {
    let parsed = parse_args_url(args)?;

    let mut netloc = None;
    let remaining: Vec<(String, String)> = parsed
        .query_pairs()
        .filter_map(|(k, v)| {
            if k == "bridging-base-url" {
                netloc = Some(v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();
    let netloc = netloc.ok_or_else(|| {
        BridgingError::InvalidPacket("missing bridging-base-url query parameter".into())
    })?;

    let query = if remaining.is_empty() {
        None
    } else {
        Some(
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(remaining)
                .finish(),
        )
    };

    Ok(rebuild(&parsed, netloc, query))
}

fn parse_args_url(args: &Args) -> BridgingResult<Url> {
    let raw = args
        .url
        .as_deref()
        .ok_or_else(|| BridgingError::InvalidPacket("missing url".into()))?;
    Url::parse(raw).map_err(|e| BridgingError::InvalidPacket(format!("bad url [{raw}]: {e}")))
}

fn rebuild(parsed: &Url, netloc: String, query: Option<String>) -> Target {
    let scheme = parsed.scheme().to_string();
    let path = parsed.path().to_string();
    let url = match &query {
        Some(q) if !q.is_empty() => format!("{scheme}://{netloc}{path}?{q}"),
        _ => format!("{scheme}://{netloc}{path}"),
    };
    Target {
        url,
        netloc,
        scheme,
        path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridging_core::Headers;

    fn http_args(url: &str, base_header: Option<(&str, &str)>) -> Args {
        let mut headers = Headers::new();
        headers.insert("Accept".into(), vec!["*/*".into()]);
        if let Some((name, value)) = base_header {
            headers.insert(name.into(), vec![value.into()]);
        }
        Args {
            url: Some(url.into()),
            headers: Some(headers),
            ..Default::default()
        }
    }

    #[test]
    fn http_host_is_overwritten_scheme_path_query_kept() {
        let args = http_args(
            "http://bridge.example:8000/api/v1/ping?x=1&y=2",
            Some(("bridging-base-url", "svc.internal:80")),
        );
        let target = transform_http_url(&args).unwrap();
        assert_eq!(target.url, "http://svc.internal:80/api/v1/ping?x=1&y=2");
        assert_eq!(target.netloc, "svc.internal:80");
        assert_eq!(target.scheme, "http");
        assert_eq!(target.path, "/api/v1/ping");
    }

    #[test]
    fn http_header_lookup_is_case_insensitive() {
        let args = http_args(
            "http://bridge.example/ping",
            Some(("Bridging-Base-URL", "svc.internal:80")),
        );
        let target = transform_http_url(&args).unwrap();
        assert_eq!(target.url, "http://svc.internal:80/ping");
    }

    #[test]
    fn http_missing_header_is_an_error() {
        let args = http_args("http://bridge.example/ping", None);
        assert!(transform_http_url(&args).is_err());
    }

    #[test]
    fn ws_param_is_consumed_and_rest_of_query_kept() {
        let args = Args {
            url: Some("ws://bridge.example/echo?a=1&bridging-base-url=echo.internal:9000&b=2".into()),
            ..Default::default()
        };
        let target = transform_ws_url(&args).unwrap();
        assert_eq!(target.netloc, "echo.internal:9000");
        assert_eq!(target.scheme, "ws");
        assert_eq!(target.path, "/echo");
        assert_eq!(target.url, "ws://echo.internal:9000/echo?a=1&b=2");
    }

    #[test]
    fn ws_only_param_leaves_no_query() {
        let args = Args {
            url: Some("ws://bridge.example/echo?bridging-base-url=echo.internal:9000".into()),
            ..Default::default()
        };
        let target = transform_ws_url(&args).unwrap();
        assert_eq!(target.url, "ws://echo.internal:9000/echo");
    }

    #[test]
    fn ws_missing_param_is_an_error() {
        let args = Args {
            url: Some("ws://bridge.example/echo?a=1".into()),
            ..Default::default()
        };
        assert!(transform_ws_url(&args).is_err());
    }

    #[test]
    fn unparseable_url_is_an_error() {
        let args = Args {
            url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(transform_http_url(&args).is_err());
        assert!(transform_ws_url(&args).is_err());
    }
}
