//! The per-request state machine: intercept gate, body acquisition, the
//! request hook, the upstream fetch, the response hook, then emit. Failures
//! in any stage become an error page that still goes through emit.

use std::{net::SocketAddr, sync::Arc};

use chrono::Utc;
use http_body_util::BodyExt;
use hyper::{
    Method, Request, Response,
    body::Incoming,
    header::{CONNECTION, CONTENT_LENGTH, HOST, HeaderValue, TRANSFER_ENCODING},
};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::{Position, Url};

use crate::{
    recorder::RecorderError,
    rules::{Rule, RuleError},
};

use super::{
    ProxyCore,
    body::{Body, BoxError, Collected, RecordingBody, collect_up_to, empty_body, full_body, incoming_body},
    client_tls::UpstreamError,
    context::{RequestContext, RequestInfo, ResponseInfo, Scheme},
    decode::{DecodeError, decode_body},
    error_page,
};

const ORIGIN_CONNECTION: &str = "x-passeur-origin-connection";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Rule hook failed: {0}")]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("Failed to decode the response body: {0}")]
    Decode(#[from] DecodeError),
    #[error("Failed to read the request body: {0}")]
    ClientBody(BoxError),
    #[error("Failed to read the response body: {0}")]
    UpstreamBody(BoxError),
    #[error("Invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    pub fn is_certificate_error(&self) -> bool {
        matches!(self, PipelineError::Upstream(e) if e.is_certificate_error())
    }
}

fn record(stage: &str, result: Result<(), RecorderError>) {
    if let Err(e) = result {
        warn!("Recorder failed at {stage}: {e}");
    }
}

pub async fn handle_request(
    core: Arc<ProxyCore>,
    req: Request<Incoming>,
    url: Url,
    protocol: Scheme,
    client_address: SocketAddr,
) -> Response<Body> {
    let rule = core.rule().await;
    let recorder = core.recorder.clone();
    let (parts, body) = req.into_parts();

    info!("{} {url}", parts.method);
    let request = RequestInfo {
        method: parts.method,
        url,
        headers: parts.headers,
        body: None,
    };
    let mut ctx = RequestContext::new(
        recorder.append_id(),
        client_address,
        protocol,
        request,
        core.settings.dangerously_ignore_unauthorized,
    );
    record("raw request", recorder.update_raw_req(&ctx));

    let stream = match process(&core, rule.as_ref(), &mut ctx, incoming_body(body)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Request {} to {} failed: {e}", ctx.record_id, ctx.request.url);
            let fallback = error_page::error_response(&e.to_string(), ctx.request.url.as_str(), e.is_certificate_error());
            ctx.response = Some(fallback.clone());
            if let Err(hook) = rule.on_error(&e, &mut ctx).await {
                warn!("Rule error hook failed: {hook}");
                ctx.response = Some(fallback);
            }
            None
        }
    };

    emit(&core, ctx, stream)
}

/// Runs every stage up to emit. Returns the upstream body when it is
/// relayed as a stream rather than held in `ctx.response`.
async fn process(
    core: &ProxyCore,
    rule: &dyn Rule,
    ctx: &mut RequestContext,
    body: Body,
) -> Result<Option<Body>, PipelineError> {
    if let Some(deal) = rule.is_deal_request(ctx).await? {
        ctx.deal_request = deal;
    }
    if !ctx.deal_request {
        debug!("Relaying request {} verbatim", ctx.record_id);
        let body = record_request_body(core, ctx.record_id, body);
        return fetch_remote(core, ctx, Some(body)).await;
    }

    rule.is_wait_req_data(ctx).await?;
    let body = if ctx.wait_req_data {
        let bytes = body.collect().await.map_err(PipelineError::ClientBody)?.to_bytes();
        record("raw request body", core.recorder.update_raw_req_body(ctx.record_id, bytes.len()));
        ctx.raw_request.body = Some(bytes.clone());
        ctx.request.body = Some(bytes);
        None
    } else {
        Some(record_request_body(core, ctx.record_id, body))
    };

    rule.before_send_request(ctx).await?;

    let stream = if ctx.response.is_none() {
        fetch_remote(core, ctx, body).await?
    } else {
        debug!("Request {} answered by the rule", ctx.record_id);
        None
    };

    rule.before_send_response(ctx).await?;
    Ok(stream)
}

fn record_request_body(core: &ProxyCore, id: u64, body: Body) -> Body {
    let recorder = core.recorder.clone();
    RecordingBody::new(body, move |size, _| {
        record("raw request body", recorder.update_raw_req_body(id, size));
    })
    .boxed()
}

fn record_response_body(core: &ProxyCore, id: u64, body: Body) -> Body {
    let recorder = core.recorder.clone();
    RecordingBody::new(body, move |size, _| {
        record("raw response body", recorder.update_raw_res_body(id, size));
    })
    .boxed()
}

fn host_header(url: &Url) -> Option<HeaderValue> {
    let host = url.host_str()?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    HeaderValue::from_str(&value).ok()
}

async fn fetch_remote(
    core: &ProxyCore,
    ctx: &mut RequestContext,
    body: Option<Body>,
) -> Result<Option<Body>, PipelineError> {
    ctx.timings.proxy_start = Some(Utc::now());

    let url = ctx.request.url.clone();
    let host = url.host_str().ok_or(UpstreamError::MissingHost)?;
    let tls = matches!(url.scheme(), "https" | "wss");
    let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });

    let mut headers = ctx.request.headers.clone();
    headers.remove(TRANSFER_ENCODING);
    headers.remove("proxy-connection");
    if let Some(host) = host_header(&url) {
        headers.insert(HOST, host);
    }

    let body = match ctx.request.body {
        Some(ref bytes) => {
            if !bytes.is_empty() {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            } else if ctx.request.method == Method::DELETE {
                headers.remove(CONTENT_LENGTH);
            } else {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
            }
            full_body(bytes.clone())
        }
        None => body.unwrap_or_else(empty_body),
    };

    let mut request = Request::builder()
        .method(ctx.request.method.clone())
        .uri(&url[Position::BeforePath..])
        .body(body)
        .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = headers;

    let stream = core
        .upstream
        .connect(host, port, tls, ctx.dangerously_ignore_unauthorized)
        .await?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(UpstreamError::from)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Upstream connection ended with an error: {e}");
        }
    });

    let response = sender.send_request(request).await.map_err(UpstreamError::from)?;
    let (parts, incoming) = response.into_parts();
    ctx.timings.proxy_end = Some(Utc::now());
    ctx.raw_response = Some(ResponseInfo {
        status: parts.status,
        headers: parts.headers.clone(),
        body: None,
    });
    record("raw response", core.recorder.update_raw_res(ctx));
    record("forwarded request", core.recorder.update_user_req(ctx));

    let raw = incoming_body(incoming);

    if !ctx.wait_res_data {
        ctx.response = Some(ResponseInfo {
            status: parts.status,
            headers: parts.headers,
            body: None,
        });
        return Ok(Some(record_response_body(core, ctx.record_id, raw)));
    }

    match collect_up_to(raw, core.settings.chunk_size_threshold)
        .await
        .map_err(PipelineError::UpstreamBody)?
    {
        Collected::Complete(bytes) => {
            record("raw response body", core.recorder.update_raw_res_body(ctx.record_id, bytes.len()));
            let mut headers = parts.headers;
            let decoded = decode_body(&mut headers, bytes.clone())?;
            if let Some(ref mut raw_response) = ctx.raw_response {
                raw_response.body = Some(bytes);
            }
            ctx.response = Some(ResponseInfo::new(parts.status, headers, decoded));
            Ok(None)
        }
        Collected::Overflow(body) => {
            debug!("Response {} crossed the buffering threshold, streaming it", ctx.record_id);
            ctx.response = Some(ResponseInfo {
                status: parts.status,
                headers: parts.headers,
                body: None,
            });
            Ok(Some(record_response_body(core, ctx.record_id, body)))
        }
    }
}

fn emit(core: &ProxyCore, mut ctx: RequestContext, stream: Option<Body>) -> Response<Body> {
    let response = match ctx.response.take() {
        Some(response) => response,
        None => error_page::error_response("No response was produced", ctx.request.url.as_str(), false),
    };

    let (headers, body) = if !ctx.deal_request {
        let body = match response.body {
            Some(ref bytes) => full_body(bytes.clone()),
            None => stream.unwrap_or_else(empty_body),
        };
        (response.headers.clone(), body)
    } else {
        let mut headers = response.headers.clone();
        headers.remove(CONTENT_LENGTH);
        if let Some(connection) = headers.remove(CONNECTION) {
            headers.insert(ORIGIN_CONNECTION, connection);
        }

        let body = match response.body {
            Some(ref bytes) => {
                if core.throttle.is_none() && !headers.contains_key(TRANSFER_ENCODING) {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
                }
                full_body(bytes.clone())
            }
            None => stream.unwrap_or_else(empty_body),
        };
        let body = match core.throttle {
            Some(ref group) => crate::throttle::throttle_body(body, group.clone()),
            None => body,
        };
        (headers, body)
    };

    let status = response.status;
    ctx.response = Some(response);
    record("delivered response", core.recorder.update_user_res(&ctx));

    let recorder = core.recorder.clone();
    let body = RecordingBody::new(body, move |_, complete| {
        if complete {
            ctx.timings.client_end = Some(Utc::now());
            record("response end", recorder.update_user_res_end(&ctx));
        } else {
            debug!("Client of request {} went away before the response ended", ctx.record_id);
        }
    })
    .boxed();

    let mut reply = Response::new(body);
    *reply.status_mut() = status;
    *reply.headers_mut() = headers;
    reply
}
