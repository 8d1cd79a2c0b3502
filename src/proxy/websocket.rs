//! WebSocket relay. The proxy completes the client handshake itself, then
//! opens its own connection to the target and forwards messages both ways.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use futures_util::{SinkExt, StreamExt};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode,
    body::Incoming,
    header::{CONNECTION, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE},
};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        handshake::derive_accept_key,
        protocol::{CloseFrame, Role, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};
use url::{Position, Url};

use crate::rules::{Rule, RuleError};

use super::{
    ProxyCore,
    body::{Body, empty_body, full_body},
    client_tls::{OutboundStream, UpstreamError},
    context::{RequestContext, RequestInfo, ResponseInfo, Scheme, WsContext, WsTarget},
};

const WEBSOCKET_MARKER: &str = "x-passeur-websocket";
/// A close frame payload is at most 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Error)]
enum RelayError {
    #[error("Rule hook failed: {0}")]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("Upstream WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}

pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Headers describing the client's own handshake are not replayed upstream;
/// the upstream handshake generates its own.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        let name_str = name.as_str();
        if name_str.starts_with("sec-websocket-")
            || matches!(
                name_str,
                "host" | "connection" | "upgrade" | "proxy-connection" | "keep-alive" | "transfer-encoding" | "content-length"
            )
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// Reserved abnormal codes cannot be sent on the wire, so they are reported
/// to the other side as a normal closure.
pub fn translate_close(code: u16, reason: &str) -> (u16, String) {
    if (1004..=1006).contains(&code) {
        (
            1000,
            format!("Normal closure. Original ws closed with code: {code} and reason: {reason}"),
        )
    } else {
        (code, reason.to_owned())
    }
}

fn truncate(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_owned();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_owned()
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: truncate(reason).into(),
    }))
}

/// The close to forward when a peer closed with `frame`, or vanished when
/// `frame` is `None`.
fn forwarded_close(frame: Option<Option<CloseFrame>>) -> Message {
    let (code, reason) = match frame {
        Some(Some(frame)) => translate_close(u16::from(frame.code), frame.reason.as_str()),
        // A close frame without a status code.
        Some(None) => translate_close(1005, ""),
        None => translate_close(1006, ""),
    };
    close_message(code, &reason)
}

fn target_of(url: &Url, headers: &HeaderMap) -> WsTarget {
    WsTarget {
        headers: forwardable_headers(headers),
        host: url.host_str().unwrap_or_default().to_owned(),
        port: url.port(),
        path: url[Position::BeforePath..].to_owned(),
        secure: matches!(url.scheme(), "https" | "wss"),
    }
}

fn status_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
}

pub async fn handle_upgrade(
    core: Arc<ProxyCore>,
    req: Request<Incoming>,
    url: Url,
    protocol: Scheme,
    client_address: SocketAddr,
) -> Response<Body> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return status_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key\n");
    };
    let accept = derive_accept_key(key.as_bytes());
    let subprotocol = req.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();

    let target = target_of(&url, req.headers());
    let ws_ctx = WsContext {
        raw: target.clone(),
        target,
    };
    info!("WebSocket {} from {client_address}", ws_ctx.raw.url());

    let mut record_ctx = RequestContext::new(
        core.recorder.append_id(),
        client_address,
        protocol,
        RequestInfo {
            method: Method::GET,
            url,
            headers: req.headers().clone(),
            body: None,
        },
        core.settings.dangerously_ignore_unauthorized,
    );
    if let Err(e) = core.recorder.update_raw_req(&record_ctx) {
        warn!("Recorder failed at raw request: {e}");
    }

    let rule = core.rule().await;
    let on_upgrade = hyper::upgrade::on(req);
    let relay_core = core.clone();
    let relay_subprotocol = subprotocol.clone();
    let spawned = core.sockets.spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                let upstream_headers =
                    relay(&relay_core, rule.as_ref(), ws_ctx, client, relay_subprotocol).await;
                if let Some(headers) = upstream_headers {
                    record_ctx.response = Some(ResponseInfo::new(StatusCode::SWITCHING_PROTOCOLS, headers, ""));
                    record_ctx.timings.client_end = Some(chrono::Utc::now());
                    let recorded = relay_core
                        .recorder
                        .update_user_res(&record_ctx)
                        .and_then(|_| relay_core.recorder.update_user_res_end(&record_ctx));
                    if let Err(e) = recorded {
                        warn!("Recorder failed at WebSocket end: {e}");
                    }
                }
            }
            Err(e) => debug!("WebSocket upgrade failed: {e}"),
        }
    });
    if spawned.is_none() {
        return status_response(StatusCode::SERVICE_UNAVAILABLE, "Proxy is shutting down\n");
    }

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&accept) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    }
    if let Some(subprotocol) = subprotocol {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, subprotocol);
    }
    headers.insert(WEBSOCKET_MARKER, HeaderValue::from_static("true"));
    response
}

async fn connect_upstream(
    core: &ProxyCore,
    target: &WsTarget,
    subprotocol: Option<HeaderValue>,
) -> Result<(WebSocketStream<OutboundStream>, HeaderMap), RelayError> {
    let stream = core
        .upstream
        .connect(
            &target.host,
            target.port_or_default(),
            target.secure,
            core.settings.dangerously_ignore_unauthorized,
        )
        .await?;

    let mut request = target.url().into_client_request()?;
    for (name, value) in &target.headers {
        request.headers_mut().append(name.clone(), value.clone());
    }
    if let Some(subprotocol) = subprotocol {
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, subprotocol);
    }

    let (upstream, response) = tokio_tungstenite::client_async(request, stream).await?;
    Ok((upstream, response.headers().clone()))
}

/// Relays one session until either side closes. Returns the upstream
/// handshake headers when the upstream connection was established.
async fn relay<C>(
    core: &ProxyCore,
    rule: &dyn Rule,
    mut ctx: WsContext,
    client: WebSocketStream<C>,
    subprotocol: Option<HeaderValue>,
) -> Option<HeaderMap>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_sink, mut client_stream) = client.split();

    let connect = async {
        rule.before_ws_client(&mut ctx).await?;
        debug!("Connecting WebSocket upstream {}", ctx.target.url());
        connect_upstream(core, &ctx.target, subprotocol).await
    };
    tokio::pin!(connect);

    // Client messages arriving before the upstream is ready wait here, in order.
    let mut pending: VecDeque<Message> = VecDeque::new();
    let connected = loop {
        tokio::select! {
            result = &mut connect => break result,
            message = client_stream.next() => match message {
                Some(Ok(message)) => pending.push_back(message),
                Some(Err(e)) => {
                    debug!("WebSocket client failed before the upstream was ready: {e}");
                    return None;
                }
                None => {
                    debug!("WebSocket client left before the upstream was ready");
                    return None;
                }
            },
        }
    };

    let (upstream, upstream_headers) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            warn!("WebSocket upstream error: {e}");
            let _ = client_sink.send(close_message(1001, &e.to_string())).await;
            return None;
        }
    };
    let (mut upstream_sink, mut upstream_stream) = upstream.split();

    let client_to_upstream = async {
        for message in pending {
            let closing = message.is_close();
            let message = match message {
                Message::Close(frame) => forwarded_close(Some(frame)),
                message => message,
            };
            if upstream_sink.send(message).await.is_err() || closing {
                return;
            }
        }

        loop {
            match client_stream.next().await {
                Some(Ok(Message::Close(frame))) => {
                    let _ = upstream_sink.send(forwarded_close(Some(frame))).await;
                    return;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(message)) => {
                    if upstream_sink.send(message).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    debug!("WebSocket client stream error: {e}");
                    let _ = upstream_sink.send(forwarded_close(None)).await;
                    return;
                }
                None => {
                    let _ = upstream_sink.send(forwarded_close(None)).await;
                    return;
                }
            }
        }
    };

    let upstream_to_client = async {
        loop {
            match upstream_stream.next().await {
                Some(Ok(Message::Close(frame))) => {
                    let _ = client_sink.send(forwarded_close(Some(frame))).await;
                    return;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(message)) => {
                    if client_sink.send(message).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!("WebSocket upstream error: {e}");
                    let _ = client_sink.send(close_message(1001, &e.to_string())).await;
                    return;
                }
                None => {
                    let _ = client_sink.send(forwarded_close(None)).await;
                    return;
                }
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    Some(upstream_headers)
}
