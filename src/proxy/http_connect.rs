use std::{io, net::SocketAddr, sync::Arc};

use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{CONTENT_TYPE, HeaderValue},
    upgrade::Upgraded,
};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info, warn};

use crate::{
    rules::{Rule, RuleError},
    throttle::copy_throttled,
};

use super::{
    ProxyCore,
    body::{Body, empty_body},
    context::{ConnectContext, Scheme},
    error_page::{PROXY_ERROR, PROXY_ERROR_MESSAGE, header_safe},
    protocol_detect::detect_protocol,
    tls_pool::TlsPoolError,
};

const FIRST_READ_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Rule hook failed: {0}")]
    Rule(#[from] RuleError),
    #[error("Failed to read from the client: {0}")]
    ClientIo(io::Error),
    #[error("Client closed the tunnel before sending anything")]
    ClientClosed,
    #[error("TLS termination unavailable: {0}")]
    Pool(#[from] TlsPoolError),
    #[error("Connection to {target} failed: {source}")]
    Upstream { target: String, source: io::Error },
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

async fn report(rule: &dyn Rule, error: &ConnectError, ctx: &ConnectContext) {
    warn!("CONNECT to {} failed: {error}", ctx.host);
    if let Err(e) = rule.on_connect_error(error, ctx).await {
        warn!("Rule connect error hook failed: {e}");
    }
}

fn bad_gateway(error: &ConnectError) -> Response<Body> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    let headers = response.headers_mut();
    headers.insert(PROXY_ERROR, HeaderValue::from_static("true"));
    headers.insert(PROXY_ERROR_MESSAGE, header_safe(&error.to_string()));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    response
}

/// Answers a CONNECT on the plain listener. The tunnel itself is set up
/// after the `200` reaches the client, once the first bytes show what the
/// client is about to speak.
///
/// References:
/// - https://docs.rs/hyper/latest/hyper/upgrade/index.html
/// - https://github.com/hyperium/hyper/blob/master/examples/http_proxy.rs
pub async fn handle_connect(core: Arc<ProxyCore>, req: Request<Incoming>, client_address: SocketAddr) -> Response<Body> {
    let Some(target) = req.uri().authority().cloned() else {
        debug!("Invalid authority in CONNECT URI from {client_address}");
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return response;
    };

    let ctx = ConnectContext {
        host: target.host().trim_start_matches('[').trim_end_matches(']').to_owned(),
        port: target.port_u16(),
        protocol: Scheme::Https,
    };
    info!("CONNECT {target} from {client_address}");

    let rule = core.rule().await;
    let intercept = if core.settings.force_no_intercept {
        false
    } else {
        match rule.is_deal_connect(&ctx).await {
            Ok(decision) => decision.unwrap_or(true),
            Err(e) => {
                let error = ConnectError::Rule(e);
                report(rule.as_ref(), &error, &ctx).await;
                return bad_gateway(&error);
            }
        }
    };

    let tunnel_core = core.clone();
    let spawned = core.sockets.spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => tunnel(tunnel_core, rule, ctx, intercept, TokioIo::new(upgraded)).await,
            Err(e) => debug!("CONNECT upgrade failed: {e}"),
        }
    });
    if spawned.is_none() {
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        return response;
    }

    Response::new(empty_body())
}

async fn tunnel(
    core: Arc<ProxyCore>,
    rule: Arc<dyn Rule>,
    ctx: ConnectContext,
    intercept: bool,
    mut client: TokioIo<Upgraded>,
) {
    let (server, first, intercepted) = match open_target(&core, &ctx, intercept, &mut client).await {
        Ok(opened) => opened,
        Err(error) => {
            report(rule.as_ref(), &error, &ctx).await;
            let message = header_safe(&error.to_string());
            let reply = format!(
                "HTTP/1.1 502 Bad Gateway\r\n{PROXY_ERROR}: true\r\n{PROXY_ERROR_MESSAGE}: {}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n",
                message.to_str().unwrap_or_default()
            );
            let _ = client.write_all(reply.as_bytes()).await;
            let _ = client.shutdown().await;
            return;
        }
    };

    if let Err(e) = relay(&core, client, server, &first, intercepted).await {
        debug!("CONNECT tunnel to {} ended with an error: {e}", ctx.host);
    }
}

/// Reads the first client bytes and connects to wherever they should go.
async fn open_target(
    core: &Arc<ProxyCore>,
    ctx: &ConnectContext,
    intercept: bool,
    client: &mut TokioIo<Upgraded>,
) -> Result<(TcpStream, Vec<u8>, bool), ConnectError> {
    let mut first = vec![0u8; FIRST_READ_SIZE];
    let read = client.read(&mut first).await.map_err(ConnectError::ClientIo)?;
    if read == 0 {
        return Err(ConnectError::ClientClosed);
    }
    first.truncate(read);

    let (target, intercepted) = if detect_protocol(&first).is_plain_websocket_bootstrap() {
        // Unencrypted WebSocket through CONNECT: let the plain listener relay it.
        debug!("Plain WebSocket through CONNECT to {}", ctx.host);
        (core.loopback_addr.to_string(), false)
    } else if intercept {
        let addr = core.tls_pool.get_server(&ctx.host, core.tls_handler()).await?;
        (addr.to_string(), true)
    } else {
        (authority(&ctx.host, ctx.port.unwrap_or(80)), false)
    };

    let server = TcpStream::connect(&target)
        .await
        .map_err(|source| ConnectError::Upstream { target, source })?;
    let _ = server.set_nodelay(true);
    Ok((server, first, intercepted))
}

async fn relay(
    core: &ProxyCore,
    mut client: TokioIo<Upgraded>,
    mut server: TcpStream,
    first: &[u8],
    intercepted: bool,
) -> io::Result<()> {
    server.write_all(first).await?;

    match core.throttle {
        Some(ref group) if intercepted => {
            let (mut client_read, mut client_write) = tokio::io::split(client);
            let (mut server_read, mut server_write) = server.into_split();
            let upstream = async {
                tokio::io::copy(&mut client_read, &mut server_write).await?;
                server_write.shutdown().await
            };
            let downstream = copy_throttled(&mut server_read, &mut client_write, group);
            tokio::try_join!(upstream, downstream)?;
        }
        _ => {
            tokio::io::copy_bidirectional(&mut client, &mut server).await?;
        }
    }
    Ok(())
}
