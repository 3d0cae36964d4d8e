//! Interim status pages and problem pages served instead of a forwarded response
//!
//! HTML is embedded in the binary. Clients that ask for `application/json`
//! get the same information as an [`ErrorResponse`](crate::error::ErrorResponse).

use crate::error::{json_error_response, ProxyErrorCode, X_PROXY_ERROR};
use crate::extract::TARGET_HEADER;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use hyper::{Response, StatusCode};

/// Seconds between automatic reloads of the loading page
pub const LOADING_REFRESH_SECS: u32 = 2;
/// Seconds between automatic reloads of the shutting-down page
pub const SHUTDOWN_REFRESH_SECS: u32 = 5;

/// Whether the client prefers a JSON body over HTML
pub fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false)
}

/// Page shown while a group is being started
pub fn loading_page(group_name: &str, json: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
    if json {
        return with_retry_after(
            json_error_response(
                ProxyErrorCode::ServiceLoading,
                format!("group '{}' is starting, retry shortly", group_name),
            ),
            LOADING_REFRESH_SECS,
        );
    }

    let body = LOADING_HTML
        .replace("{{STYLE}}", PAGE_STYLE)
        .replace("{{REFRESH}}", &LOADING_REFRESH_SECS.to_string())
        .replace("{{GROUP_NAME}}", &escape_html(group_name))
        .replace("{{TARGET_HEADER}}", TARGET_HEADER);

    html_response(ProxyErrorCode::ServiceLoading, body, Some(LOADING_REFRESH_SECS))
}

/// Page shown while a group is being stopped
pub fn shutdown_page(group_name: &str, json: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
    if json {
        return with_retry_after(
            json_error_response(
                ProxyErrorCode::ServiceShuttingDown,
                format!("group '{}' is shutting down, retry shortly", group_name),
            ),
            SHUTDOWN_REFRESH_SECS,
        );
    }

    let body = SHUTDOWN_HTML
        .replace("{{STYLE}}", PAGE_STYLE)
        .replace("{{REFRESH}}", &SHUTDOWN_REFRESH_SECS.to_string())
        .replace("{{GROUP_NAME}}", &escape_html(group_name));

    html_response(ProxyErrorCode::ServiceShuttingDown, body, Some(SHUTDOWN_REFRESH_SECS))
}

/// Generic failure page
pub fn problem_page(code: ProxyErrorCode, message: &str, json: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
    if json {
        return json_error_response(code, message);
    }

    let body = PROBLEM_HTML
        .replace("{{STYLE}}", PAGE_STYLE)
        .replace("{{STATUS}}", &code.status_code().as_u16().to_string())
        .replace("{{CODE}}", code.as_header_value())
        .replace("{{ERROR}}", &escape_html(message))
        .replace("{{TARGET_HEADER}}", TARGET_HEADER);

    html_response(code, body, None)
}

/// `302 Found` back to the same path so the client retries the request
pub fn retry_redirect(path_and_query: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let location = HeaderValue::from_str(path_and_query).unwrap_or_else(|_| HeaderValue::from_static("/"));

    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .header(CACHE_CONTROL, "no-store")
        .header(X_PROXY_ERROR, ProxyErrorCode::BackendUnavailable.as_header_value())
        .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
        .expect("valid redirect response")
}

fn html_response(
    code: ProxyErrorCode,
    body: String,
    retry_after: Option<u32>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let response = Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(CACHE_CONTROL, "no-store")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid page response with static headers");

    match retry_after {
        Some(secs) => with_retry_after(response, secs),
        None => response,
    }
}

fn with_retry_after(
    mut response: Response<BoxBody<Bytes, hyper::Error>>,
    secs: u32,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
    response
}

/// Escape text for interpolation into HTML
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const PAGE_STYLE: &str = r#"
    body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; background: #f4f5f7; color: #1f2933; margin: 0; }
    main { max-width: 36rem; margin: 12vh auto; padding: 2rem; background: #fff; border-radius: 8px; box-shadow: 0 2px 8px rgba(0,0,0,.08); }
    h1 { font-size: 1.4rem; margin-top: 0; }
    code { background: #eef0f3; padding: .1rem .3rem; border-radius: 3px; }
    .spinner { width: 2rem; height: 2rem; border: 3px solid #d9dde3; border-top-color: #3b82f6; border-radius: 50%; animation: spin 1s linear infinite; }
    @keyframes spin { to { transform: rotate(360deg); } }
    .muted { color: #6b7280; font-size: .9rem; }
    pre { white-space: pre-wrap; background: #fef2f2; color: #991b1b; padding: 1rem; border-radius: 4px; }
"#;

const LOADING_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta http-equiv="refresh" content="{{REFRESH}}">
    <title>Starting {{GROUP_NAME}}</title>
    <style>{{STYLE}}</style>
</head>
<body>
    <main>
        <div class="spinner"></div>
        <h1>Starting <strong>{{GROUP_NAME}}</strong></h1>
        <p>The service was idle and is being started. This page reloads every {{REFRESH}} seconds and will show the service once it is ready.</p>
        <p class="muted">Scripts can target a service explicitly with the <code>{{TARGET_HEADER}}</code> header.</p>
    </main>
</body>
</html>
"#;

const SHUTDOWN_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta http-equiv="refresh" content="{{REFRESH}}">
    <title>Stopping {{GROUP_NAME}}</title>
    <style>{{STYLE}}</style>
</head>
<body>
    <main>
        <h1><strong>{{GROUP_NAME}}</strong> is shutting down</h1>
        <p>The service was stopped after a period of inactivity. Once the shutdown completes it will be started again automatically.</p>
        <p class="muted">This page reloads every {{REFRESH}} seconds.</p>
    </main>
</body>
</html>
"#;

const PROBLEM_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{{STATUS}} {{CODE}}</title>
    <style>{{STYLE}}</style>
</head>
<body>
    <main>
        <h1>Something went wrong</h1>
        <pre>{{ERROR}}</pre>
        <p>Status <code>{{STATUS}}</code>, error code <code>{{CODE}}</code>.</p>
        <p class="muted">Name the service with the <code>{{TARGET_HEADER}}</code> header if the address could not be matched.</p>
    </main>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_string(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_wants_json() {
        let mut headers = HeaderMap::new();
        assert!(!wants_json(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        assert!(!wants_json(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("Application/JSON"));
        assert!(wants_json(&headers));
    }

    #[tokio::test]
    async fn test_loading_page() {
        let response = loading_page("stack", false);

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "2");
        assert_eq!(response.headers().get(X_PROXY_ERROR).unwrap(), "SERVICE_LOADING");
        assert!(response
            .headers()
            .get(CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("text/html"));

        let body = body_string(response).await;
        assert!(body.contains("Starting <strong>stack</strong>"));
        assert!(body.contains(r#"content="2""#));
    }

    #[tokio::test]
    async fn test_shutdown_page_escapes_group_name() {
        let response = shutdown_page("<script>", false);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "5");

        let body = body_string(response).await;
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("<script>"));
    }

    #[tokio::test]
    async fn test_json_pages() {
        let response = loading_page("stack", true);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "2");
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");

        let body = body_string(response).await;
        assert!(body.contains("\"code\":\"SERVICE_LOADING\""));

        let response = problem_page(ProxyErrorCode::UnknownService, "no container serves service 'x'", true);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("\"status\":404"));
    }

    #[tokio::test]
    async fn test_problem_page() {
        let response = problem_page(ProxyErrorCode::MissingServiceName, "no service name in request", false);

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get(X_PROXY_ERROR).unwrap(), "MISSING_SERVICE_NAME");
        assert!(response.headers().get(RETRY_AFTER).is_none());

        let body = body_string(response).await;
        assert!(body.contains("no service name in request"));
        assert!(body.contains("x-wakegate-target"));
    }

    #[test]
    fn test_retry_redirect() {
        let response = retry_redirect("/web/page?x=1");

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/web/page?x=1");
        assert_eq!(response.headers().get(X_PROXY_ERROR).unwrap(), "BACKEND_UNAVAILABLE");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html(r#"a & "b" <'c'>"#), "a &amp; &quot;b&quot; &lt;&#39;c&#39;&gt;");
    }
}
