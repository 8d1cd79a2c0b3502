use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{CONTENT_TYPE, HOST, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use url::Url;

use super::{
    ProxyCore, admin,
    body::{Body, full_body},
    context::Scheme,
    http_connect, pipeline, websocket,
};

/// Serves HTTP/1.1 on one client connection, plain or TLS terminated.
pub async fn serve<IO>(core: Arc<ProxyCore>, io: IO, client_address: SocketAddr, scheme: Scheme)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| route(core.clone(), req, client_address, scheme));
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!("Connection from {client_address} ended with an error: {e}");
    }
}

fn text(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// The absolute URL of a request: absolute-form as sent to a proxy, or
/// origin-form completed with the `Host` header.
fn resolve_url(req: &Request<Incoming>, scheme: Scheme) -> Option<Url> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))?;
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    Url::parse(&format!("{}://{host}{path}", scheme.as_str())).ok()
}

async fn route(
    core: Arc<ProxyCore>,
    req: Request<Incoming>,
    client_address: SocketAddr,
    scheme: Scheme,
) -> Result<Response<Body>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(match scheme {
            Scheme::Http => http_connect::handle_connect(core, req, client_address).await,
            Scheme::Https => text(StatusCode::METHOD_NOT_ALLOWED, "CONNECT is not supported here\n"),
        });
    }

    let origin_form = req.uri().scheme().is_none();
    if scheme == Scheme::Http && origin_form && req.uri().path().starts_with(admin::ADMIN_PREFIX) {
        return Ok(admin::handle(core, req).await);
    }

    let Some(url) = resolve_url(&req, scheme) else {
        return Ok(text(StatusCode::BAD_REQUEST, "Cannot determine the request target\n"));
    };

    if websocket::is_upgrade(req.headers()) {
        return Ok(websocket::handle_upgrade(core, req, url, scheme, client_address).await);
    }

    // Origin-form on the plain listener is a request for the proxy itself.
    if scheme == Scheme::Http && origin_form {
        return Ok(text(StatusCode::NOT_FOUND, "Not found\n"));
    }

    Ok(pipeline::handle_request(core, req, url, scheme, client_address).await)
}
