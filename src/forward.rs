use axum::body::{Body, HttpBody};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::Response;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use url::Url;

use crate::error::UpstreamError;
use crate::metrics::UPSTREAM_LATENCY;
use crate::routes::ServiceRoute;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

// Headers that describe a single connection and must not be relayed
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Relays requests to upstreams over a shared connection pool.
///
/// Never retries and never follows redirects; whatever the upstream answers
/// goes back to the client as-is.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    response_timeout: Duration,
}

impl Forwarder {
    pub fn new(connect_timeout: Duration, response_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            response_timeout,
        })
    }

    pub async fn relay(
        &self,
        route: &ServiceRoute,
        request: Request,
        rewritten_path: &str,
        client_ip: IpAddr,
    ) -> Result<Response, UpstreamError> {
        let (parts, body) = request.into_parts();
        let url = upstream_url(&route.upstream, rewritten_path, parts.uri.query());

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        append_forwarded_for(&mut headers, client_ip);

        tracing::info!(
            service = %route.name,
            method = %parts.method,
            client = %client_ip,
            upstream = %url,
            "forwarding request"
        );

        let mut builder = self.client.request(parts.method, url).headers(headers);
        // an empty body is sent as-is rather than as a chunked stream
        if body.size_hint().exact() != Some(0) {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let started = Instant::now();
        let upstream = match tokio::time::timeout(self.response_timeout, builder.send()).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => return Err(UpstreamError::from_reqwest(e, self.response_timeout)),
            Err(_) => return Err(UpstreamError::Timeout(self.response_timeout)),
        };
        UPSTREAM_LATENCY
            .with_label_values(&[route.name.as_str()])
            .observe(started.elapsed().as_secs_f64());

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        // body streams through; dropping it (client gone) drops the upstream connection
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Base URL path joined with the rewritten path, plus the inbound query.
// Dot segments (also percent-encoded ones) are resolved by `Url`, so the
// upstream never sees `..` and a path cannot climb above the base path.
pub fn upstream_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    url.set_path(&join_paths(base.path(), path));
    url.set_query(query);
    url
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // headers named in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in &listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {client_ip}", prior.join(", "))
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_upstream_url_joins_root_base() {
        let base = Url::parse("http://host:4000").unwrap();
        assert_eq!(
            upstream_url(&base, "/v1/models", None).as_str(),
            "http://host:4000/v1/models"
        );
        assert_eq!(upstream_url(&base, "/", None).as_str(), "http://host:4000/");
    }

    #[test]
    fn test_upstream_url_keeps_base_path_and_query() {
        let base = Url::parse("http://host:4000/api").unwrap();
        assert_eq!(
            upstream_url(&base, "/v1/models", Some("limit=5")).as_str(),
            "http://host:4000/api/v1/models?limit=5"
        );

        let base = Url::parse("http://host:4000/api/").unwrap();
        assert_eq!(
            upstream_url(&base, "/v1", None).as_str(),
            "http://host:4000/api/v1"
        );
    }

    #[test]
    fn test_upstream_url_resolves_dot_segments() {
        let base = Url::parse("http://host:4000").unwrap();
        assert_eq!(upstream_url(&base, "/a/../b", None).as_str(), "http://host:4000/b");
        assert_eq!(upstream_url(&base, "/a/%2e%2e/b", None).as_str(), "http://host:4000/b");
        assert_eq!(upstream_url(&base, "/a/./b", None).as_str(), "http://host:4000/a/b");

        let base = Url::parse("http://host:4000/api").unwrap();
        assert_eq!(upstream_url(&base, "/../../etc", None).as_str(), "http://host:4000/etc");
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/a/", "/b"), "/a/b");
        assert_eq!(join_paths("/a", "b"), "/a/b");
        assert_eq!(join_paths("/a", "/b"), "/a/b");
        assert_eq!(join_paths("/a/", "b"), "/a/b");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(header::AUTHORIZATION));
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7));

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, ip);
        assert_eq!(headers[X_FORWARDED_FOR], "192.168.1.7");

        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        append_forwarded_for(&mut headers, ip);
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.1, 192.168.1.7");
    }
}
