//! Service name extraction from inbound requests
//!
//! Each strategy is a pure function of the request URI and headers. An empty
//! result is treated the same as a missing one.

use hyper::header::{HeaderMap, HOST};
use hyper::Uri;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Query parameter read by the `query` strategy
pub const QUERY_PARAM: &str = "wakegate_service";

/// Reserved header read by the `header` strategy
pub const TARGET_HEADER: &str = "x-wakegate-target";

/// How the proxy derives a service name from a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceNameExtractor {
    /// `?wakegate_service=<name>`
    Query,
    /// `X-Wakegate-Target: <name>`
    Header,
    /// `/<name>/...`
    Path,
    /// `<name>.example.com`
    Subdomain,
}

impl ServiceNameExtractor {
    pub fn extract(&self, uri: &Uri, headers: &HeaderMap) -> Option<String> {
        let name = match self {
            ServiceNameExtractor::Query => from_query(uri),
            ServiceNameExtractor::Header => from_header(headers),
            ServiceNameExtractor::Path => from_path(uri),
            ServiceNameExtractor::Subdomain => from_subdomain(uri, headers),
        }?;

        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceNameExtractor::Query => "query",
            ServiceNameExtractor::Header => "header",
            ServiceNameExtractor::Path => "path",
            ServiceNameExtractor::Subdomain => "subdomain",
        }
    }
}

impl fmt::Display for ServiceNameExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceNameExtractor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "query" => Ok(ServiceNameExtractor::Query),
            "header" => Ok(ServiceNameExtractor::Header),
            "path" => Ok(ServiceNameExtractor::Path),
            "subdomain" => Ok(ServiceNameExtractor::Subdomain),
            other => Err(format!(
                "unknown service name extractor '{}', expected one of: query, header, path, subdomain",
                other
            )),
        }
    }
}

fn decode(raw: &str) -> Option<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .ok()
        .map(|s| s.into_owned())
}

fn from_query(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| decode(key).as_deref() == Some(QUERY_PARAM))
        .and_then(|(_, value)| decode(value))
        .map(|value| value.trim_end_matches('/').to_string())
}

fn from_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TARGET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

fn from_path(uri: &Uri) -> Option<String> {
    uri.path()
        .split('/')
        .find(|segment| !segment.is_empty())
        .and_then(decode)
}

fn from_subdomain(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))?;

    // Strip the port, if any
    let hostname = host.rsplit_once(':').map_or(host, |(name, _)| name);

    let mut labels = hostname.split('.');
    let first = labels.next()?;
    labels.next()?;

    Some(first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    fn host(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_query_extractor() {
        let extractor = ServiceNameExtractor::Query;
        let headers = HeaderMap::new();

        assert_eq!(
            extractor.extract(&uri("/?wakegate_service=web"), &headers),
            Some("web".to_string())
        );
        assert_eq!(
            extractor.extract(&uri("/a/b?x=1&wakegate_service=my%20app/"), &headers),
            Some("my app".to_string())
        );
        assert_eq!(extractor.extract(&uri("/?wakegate_service="), &headers), None);
        assert_eq!(extractor.extract(&uri("/?other=web"), &headers), None);
        assert_eq!(extractor.extract(&uri("/"), &headers), None);
    }

    #[test]
    fn test_header_extractor() {
        let extractor = ServiceNameExtractor::Header;
        let mut headers = HeaderMap::new();
        assert_eq!(extractor.extract(&uri("/"), &headers), None);

        headers.insert("X-Wakegate-Target", HeaderValue::from_static("web"));
        assert_eq!(extractor.extract(&uri("/"), &headers), Some("web".to_string()));

        headers.insert("X-Wakegate-Target", HeaderValue::from_static("  "));
        assert_eq!(extractor.extract(&uri("/"), &headers), None);
    }

    #[test]
    fn test_path_extractor() {
        let extractor = ServiceNameExtractor::Path;
        let headers = HeaderMap::new();

        assert_eq!(extractor.extract(&uri("/web/index.html"), &headers), Some("web".to_string()));
        assert_eq!(extractor.extract(&uri("//web"), &headers), Some("web".to_string()));
        assert_eq!(extractor.extract(&uri("/"), &headers), None);
    }

    #[test]
    fn test_subdomain_extractor() {
        let extractor = ServiceNameExtractor::Subdomain;

        assert_eq!(
            extractor.extract(&uri("/"), &host("web.example.com:8080")),
            Some("web".to_string())
        );
        assert_eq!(
            extractor.extract(&uri("/"), &host("Blog.localhost")),
            Some("Blog".to_string())
        );
        assert_eq!(extractor.extract(&uri("/"), &host("localhost:8080")), None);
        assert_eq!(extractor.extract(&uri("/"), &host(".example.com")), None);
        assert_eq!(
            extractor.extract(&uri("http://api.example.com/"), &HeaderMap::new()),
            Some("api".to_string())
        );
    }

    #[test]
    fn test_parse_extractor_kind() {
        assert_eq!("query".parse(), Ok(ServiceNameExtractor::Query));
        assert_eq!("Subdomain".parse(), Ok(ServiceNameExtractor::Subdomain));
        assert!("cookie".parse::<ServiceNameExtractor>().is_err());
        assert_eq!(ServiceNameExtractor::Path.to_string(), "path");
    }
}
