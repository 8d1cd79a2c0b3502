use hyper::{
    HeaderMap, StatusCode,
    header::{CONTENT_TYPE, HeaderValue},
};

use crate::proxy::context::ResponseInfo;

pub const PROXY_ERROR: &str = "proxy-error";
pub const PROXY_ERROR_MESSAGE: &str = "proxy-error-message";

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Header values cannot carry control characters or non-ASCII text.
pub fn header_safe(message: &str) -> HeaderValue {
    let cleaned: String = message
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { ' ' })
        .collect();
    HeaderValue::from_str(cleaned.trim()).unwrap_or_else(|_| HeaderValue::from_static("proxy error"))
}

fn page(title: &str, explain: &str, detail: &str, url: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n<body>\n\
         <h1>{title}</h1>\n<p>{explain}</p>\n<p>URL: <code>{url}</code></p>\n<pre>{detail}</pre>\n</body>\n</html>\n",
        url = escape_html(url),
        detail = escape_html(detail),
    )
}

/// The response delivered when a request fails inside the proxy.
pub fn error_response(message: &str, url: &str, certificate_error: bool) -> ResponseInfo {
    let body = if certificate_error {
        page(
            "The connection is not secure",
            "The site presented a certificate that was not issued by a known authority, \
             which usually means it is self-signed. If you know and trust this site, \
             set <strong>dangerously-ignore-unauthorized</strong> to continue.",
            message,
            url,
        )
    } else {
        page("Proxy error", "The proxy could not complete this request.", message, url)
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    headers.insert(PROXY_ERROR, HeaderValue::from_static("true"));
    headers.insert(PROXY_ERROR_MESSAGE, header_safe(message));

    ResponseInfo::new(StatusCode::INTERNAL_SERVER_ERROR, headers, body)
}
