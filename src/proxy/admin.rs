//! Control endpoints served on the plain listener under `/__passeur/`.

use std::{
    path::{Component, Path},
    sync::Arc,
    time::Duration,
};

use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{CONTENT_TYPE, HeaderValue},
};
use tracing::{error, info};

use super::{
    ProxyCore,
    body::{Body, empty_body, full_body},
};

pub const ADMIN_PREFIX: &str = "/__passeur/";

/// Lets the close acknowledgement reach the client before sockets are torn down.
const CLOSE_DELAY: Duration = Duration::from_millis(50);

fn response(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text(status: StatusCode, message: &'static str) -> Response<Body> {
    response(status, "text/plain; charset=utf-8", full_body(message))
}

fn json<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => response(StatusCode::OK, "application/json", full_body(bytes)),
        Err(e) => {
            error!("Failed to serialize records: {e}");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed\n")
        }
    }
}

fn query_id(query: Option<&str>) -> Option<u64> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "id")
        .and_then(|(_, value)| value.parse().ok())
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("js" | "mjs") => "application/javascript",
        Some("css") => "text/css",
        Some("json" | "map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// `relative` as a path that cannot leave the directory it is joined to.
fn confined(relative: &str) -> Option<&Path> {
    let path = Path::new(relative);
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
        .then_some(path)
}

async fn serve_static(core: &ProxyCore, relative: &str) -> Response<Body> {
    let Some(ref root) = core.settings.web_root else {
        return text(StatusCode::NOT_FOUND, "Not found\n");
    };
    let relative = if relative.is_empty() { "index.html" } else { relative };
    let Some(relative) = confined(relative) else {
        return text(StatusCode::NOT_FOUND, "Not found\n");
    };

    let path = root.join(relative);
    match tokio::fs::read(&path).await {
        Ok(contents) => response(StatusCode::OK, mime_type(&path), full_body(contents)),
        Err(_) => text(StatusCode::NOT_FOUND, "Not found\n"),
    }
}

pub async fn handle(core: Arc<ProxyCore>, req: Request<Incoming>) -> Response<Body> {
    let path = req.uri().path().to_owned();
    let id = query_id(req.uri().query());
    drop(req);

    let Some(route) = path.strip_prefix(ADMIN_PREFIX) else {
        return text(StatusCode::NOT_FOUND, "Not found\n");
    };

    match route {
        "api/reload_rule" => {
            let mut state = core.state.write().await;
            match state.reload_rule(&core.settings) {
                Ok(()) => info!("Rule reloaded"),
                Err(e) => error!("Rule reload failed, keeping the active rule: {e:?}"),
            }
            text(StatusCode::OK, "refresh user rule")
        }
        "api/close" => {
            let core = core.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CLOSE_DELAY).await;
                core.close();
            });
            text(StatusCode::OK, "passeur close")
        }
        "api/logs" => json(&core.recorder.logs()),
        "api/log" => match id {
            Some(id) => json(&core.recorder.log(id)),
            None => response(StatusCode::OK, "application/json", empty_body()),
        },
        route => match route.strip_prefix("web/") {
            Some(file) => serve_static(&core, file).await,
            None if route == "web" => serve_static(&core, "").await,
            None => text(StatusCode::NOT_FOUND, "Not found\n"),
        },
    }
}
