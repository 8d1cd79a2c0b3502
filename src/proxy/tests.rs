//! End-to-end tests driving a real proxy on loopback sockets.

use std::{
    convert::Infallible,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{CONTENT_ENCODING, CONTENT_LENGTH, HOST, HeaderValue, TRANSFER_ENCODING},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};
use tokio_rustls::{
    TlsAcceptor, TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};
use tokio_tungstenite::tungstenite::Message;

use super::{
    context::{ConnectContext, RequestContext, ResponseInfo},
    *,
};
use crate::{
    certs::RootAuthority,
    recorder::MemoryRecorder,
    rules::{DefaultRule, RuleError},
};

struct TestProxy {
    addr: SocketAddr,
    handle: ProxyHandle,
    authority: RootAuthority,
    run: JoinHandle<()>,
}

async fn start_proxy(rule: Arc<dyn Rule>, configure: impl FnOnce(&mut Settings)) -> TestProxy {
    let mut settings = Settings {
        listen_address: "127.0.0.1:0".parse().unwrap(),
        ..Settings::default()
    };
    configure(&mut settings);

    let authority = RootAuthority::generate().unwrap();
    let state = Arc::new(RwLock::new(State::with_rule(rule)));
    let server = ProxyServer::bind(
        Arc::new(settings),
        state,
        Arc::new(MemoryRecorder::new()),
        Arc::new(authority.clone()),
    )
    .await
    .unwrap();

    let handle = server.handle();
    TestProxy {
        addr: handle.local_addr(),
        handle,
        authority,
        run: tokio::spawn(server.run()),
    }
}

struct Upstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

async fn serve_upstream<IO, F>(io: IO, respond: Arc<F>, hits: Arc<AtomicUsize>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        hits.fetch_add(1, Ordering::SeqCst);
        let response = respond(&req);
        async move { Ok::<_, Infallible>(response) }
    });
    let _ = http1::Builder::new().serve_connection(TokioIo::new(io), service).await;
}

/// An HTTP origin answering every request with `respond(&request)`, over
/// TLS when `tls` is set.
async fn upstream<F>(tls: Option<TlsAcceptor>, respond: F) -> Upstream
where
    F: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let respond = Arc::new(respond);
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let respond = respond.clone();
            let counter = counter.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => {
                        if let Ok(stream) = acceptor.accept(socket).await {
                            serve_upstream(stream, respond, counter).await;
                        }
                    }
                    None => serve_upstream(socket, respond, counter).await,
                }
            });
        }
    });

    Upstream { addr, hits }
}

fn reply(body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::new(Full::new(body.into()))
}

async fn send(proxy: SocketAddr, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
    send_method(proxy, Method::GET, uri).await
}

async fn send_method(proxy: SocketAddr, method: Method, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
    let uri: Uri = uri.parse().unwrap();
    let host = uri
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_else(|| proxy.to_string());
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(HOST, host)
        .body(Full::new(Bytes::new()))
        .unwrap();

    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(connection);
    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
}

/// Sends a CONNECT and consumes the response head, leaving the tunnel open.
async fn open_tunnel(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    (stream, String::from_utf8(head).unwrap())
}

struct BufferAll;

#[async_trait]
impl Rule for BufferAll {
    async fn is_wait_req_data(&self, ctx: &mut RequestContext) -> Result<(), RuleError> {
        ctx.wait_req_data = true;
        ctx.wait_res_data = true;
        Ok(())
    }
}

struct Synthetic;

#[async_trait]
impl Rule for Synthetic {
    async fn before_send_request(&self, ctx: &mut RequestContext) -> Result<(), RuleError> {
        ctx.response = Some(ResponseInfo::new(StatusCode::OK, HeaderMap::new(), "synthetic"));
        Ok(())
    }
}

#[derive(Default)]
struct TunnelOnly {
    connect_errors: AtomicUsize,
}

#[async_trait]
impl Rule for TunnelOnly {
    async fn is_deal_connect(&self, _ctx: &ConnectContext) -> Result<Option<bool>, RuleError> {
        Ok(Some(false))
    }

    async fn on_connect_error(&self, _error: &ConnectError, _ctx: &ConnectContext) -> Result<(), RuleError> {
        self.connect_errors.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn plain_requests_are_forwarded() {
    let origin = upstream(None, |_| {
        let mut response = reply("hello");
        response.headers_mut().insert("x-origin", HeaderValue::from_static("yes"));
        response
    })
    .await;
    let proxy = start_proxy(Arc::new(DefaultRule), |_| {}).await;

    let (status, headers, body) = send(proxy.addr, &format!("http://{}/greeting", origin.addr)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-origin"], "yes");
    assert_eq!(&body[..], b"hello");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn logs_list_completed_requests_most_recent_first() {
    let origin = upstream(None, |_| reply("ok")).await;
    let proxy = start_proxy(Arc::new(DefaultRule), |_| {}).await;

    for i in 0..3 {
        send(proxy.addr, &format!("http://{}/{i}", origin.addr)).await;
    }

    let mut ids = Vec::new();
    for _ in 0..50 {
        let (status, _, body) = send(proxy.addr, "/__passeur/api/logs").await;
        assert_eq!(status, StatusCode::OK);
        let records: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        ids = records.iter().map(|r| r["id"].as_u64().unwrap()).collect();
        if ids.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ids, vec![3, 2, 1]);

    let (_, _, body) = send(proxy.addr, "/__passeur/api/log?id=2").await;
    let record: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(record["path"], "/1");
    assert_eq!(record["statusCode"], 200);
}

#[tokio::test]
async fn synthetic_responses_never_reach_upstream() {
    let origin = upstream(None, |_| reply("from origin")).await;
    let proxy = start_proxy(Arc::new(Synthetic), |_| {}).await;

    let (status, _, body) = send(proxy.addr, &format!("http://{}/", origin.addr)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"synthetic");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn buffered_gzip_is_delivered_decoded() {
    let compressed = {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello").unwrap();
        Bytes::from(encoder.finish().unwrap())
    };
    let origin = upstream(None, move |_| {
        let mut response = reply(compressed.clone());
        response.headers_mut().insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        response
    })
    .await;
    let proxy = start_proxy(Arc::new(BufferAll), |_| {}).await;

    let (status, headers, body) = send(proxy.addr, &format!("http://{}/", origin.addr)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"hello");
    assert!(headers.get(CONTENT_ENCODING).is_none());
    assert_eq!(headers[decode::ORIGIN_CONTENT_ENCODING], "gzip");
    assert_eq!(headers[CONTENT_LENGTH], "5");
}

#[tokio::test]
async fn corrupt_gzip_becomes_an_error_page() {
    let origin = upstream(None, |_| {
        let mut response = reply("this is not gzip");
        response.headers_mut().insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        response
    })
    .await;
    let proxy = start_proxy(Arc::new(BufferAll), |_| {}).await;

    let (status, headers, _) = send(proxy.addr, &format!("http://{}/", origin.addr)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(headers[error_page::PROXY_ERROR], "true");
}

#[tokio::test]
async fn crossing_the_threshold_streams_identical_bytes() {
    let payload: Bytes = (0..100_000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    let served = payload.clone();
    let origin = upstream(None, move |_| reply(served.clone())).await;
    let url = format!("http://{}/large", origin.addr);

    let buffered = start_proxy(Arc::new(BufferAll), |_| {}).await;
    let streamed = start_proxy(Arc::new(BufferAll), |s| s.chunk_size_threshold = 1024).await;

    let (_, _, below) = send(buffered.addr, &url).await;
    let (_, _, above) = send(streamed.addr, &url).await;
    assert_eq!(below, payload);
    assert_eq!(above, payload);
}

#[tokio::test]
async fn bypassed_connect_relays_bytes_verbatim() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let proxy = start_proxy(Arc::new(TunnelOnly::default()), |_| {}).await;
    let (mut tunnel, head) = open_tunnel(proxy.addr, &echo_addr.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let sent = [0x00u8, 0x01, 0xfe, 0xff, b'x', b'\r', b'\n'];
    tunnel.write_all(&sent).await.unwrap();
    let mut received = [0u8; 7];
    tunnel.read_exact(&mut received).await.unwrap();
    assert_eq!(received, sent);
}

#[tokio::test]
async fn failed_tunnels_answer_502_and_notify_the_rule() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let rule = Arc::new(TunnelOnly::default());
    let proxy = start_proxy(rule.clone(), |_| {}).await;
    let (mut tunnel, head) = open_tunnel(proxy.addr, &closed_addr.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    tunnel.write_all(b"\x16\x03\x01hello").await.unwrap();
    let mut reply = Vec::new();
    tunnel.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 502"), "{reply}");
    assert!(reply.contains("proxy-error: true"));
    assert_eq!(rule.connect_errors.load(Ordering::SeqCst), 1);
}

/// GETs `path` from `target` through an intercepted CONNECT tunnel, trusting
/// only the proxy's root.
async fn get_through_interception(proxy: &TestProxy, target: &str, path: &str) -> (StatusCode, HeaderMap, Bytes) {
    let (tunnel, head) = open_tunnel(proxy.addr, target).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let mut roots = RootCertStore::empty();
    roots.add(proxy.authority.certificate_der().clone()).unwrap();
    let config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    let tls = TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), tunnel)
        .await
        .unwrap();

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await.unwrap();
    tokio::spawn(connection);
    let request = Request::builder()
        .uri(path)
        .header(HOST, target)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
}

#[tokio::test]
async fn intercepted_https_is_decrypted_and_forwarded() {
    let origin_authority = RootAuthority::generate().unwrap();
    let origin_certificate = origin_authority.issue("localhost").await.unwrap();
    let origin = upstream(Some(TlsAcceptor::from(origin_certificate.server_config)), |_| reply("secure hello")).await;
    let proxy = start_proxy(Arc::new(DefaultRule), |s| s.dangerously_ignore_unauthorized = true).await;

    let target = format!("localhost:{}", origin.addr.port());
    let (status, _, body) = get_through_interception(&proxy, &target, "/secure").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"secure hello");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn throttled_intercepted_responses_are_paced() {
    let payload = Bytes::from(vec![b'x'; 2048]);
    let served = payload.clone();
    let origin_authority = RootAuthority::generate().unwrap();
    let origin_certificate = origin_authority.issue("localhost").await.unwrap();
    let origin = upstream(Some(TlsAcceptor::from(origin_certificate.server_config)), move |_| {
        reply(served.clone())
    })
    .await;
    let proxy = start_proxy(Arc::new(DefaultRule), |s| {
        s.dangerously_ignore_unauthorized = true;
        s.throttle_kbps = Some(1);
    })
    .await;

    let target = format!("localhost:{}", origin.addr.port());
    let started = std::time::Instant::now();
    let (status, headers, body) = get_through_interception(&proxy, &target, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, payload);
    assert!(headers.get(CONTENT_LENGTH).is_none());

    // Emit alone owes one second past the 1 KiB burst; the encrypted splice
    // shares the same bucket and pushes the total past two.
    assert!(started.elapsed() >= Duration::from_secs(2), "{:?}", started.elapsed());
}

#[tokio::test]
async fn throttled_responses_have_no_content_length() {
    let origin = upstream(None, |_| reply("hello")).await;
    let proxy = start_proxy(Arc::new(BufferAll), |s| s.throttle_kbps = Some(1)).await;

    let (status, headers, body) = send(proxy.addr, &format!("http://{}/", origin.addr)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"hello");
    assert!(headers.get(CONTENT_LENGTH).is_none());
    assert_eq!(headers[TRANSFER_ENCODING], "chunked");
}

/// Answers with the `content-length` the origin received, or `none`.
fn received_length(req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let length = req
        .headers()
        .get(CONTENT_LENGTH)
        .map_or("none".to_owned(), |v| v.to_str().unwrap_or_default().to_owned());
    reply(length)
}

#[tokio::test]
async fn empty_delete_carries_no_content_length() {
    let origin = upstream(None, received_length).await;
    let proxy = start_proxy(Arc::new(BufferAll), |_| {}).await;
    let url = format!("http://{}/item", origin.addr);

    let (status, _, body) = send_method(proxy.addr, Method::DELETE, &url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"none");

    let (_, _, body) = send_method(proxy.addr, Method::POST, &url).await;
    assert_eq!(&body[..], b"0");
}

#[tokio::test]
async fn untrusted_upstream_certificates_are_reported() {
    let origin_authority = RootAuthority::generate().unwrap();
    let origin_certificate = origin_authority.issue("localhost").await.unwrap();
    let origin = upstream(Some(TlsAcceptor::from(origin_certificate.server_config)), |_| reply("unreachable")).await;
    let proxy = start_proxy(Arc::new(DefaultRule), |_| {}).await;

    let (status, headers, body) = send(proxy.addr, &format!("https://localhost:{}/", origin.addr.port())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(headers[error_page::PROXY_ERROR], "true");
    assert!(String::from_utf8_lossy(&body).contains("dangerously-ignore-unauthorized"));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn websocket_through_connect_keeps_message_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_text() || message.is_binary() {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    } else if message.is_close() {
                        break;
                    }
                }
            });
        }
    });

    let proxy = start_proxy(Arc::new(DefaultRule), |_| {}).await;
    let (tunnel, head) = open_tunnel(proxy.addr, &ws_addr.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let (mut ws, response) = tokio_tungstenite::client_async(format!("ws://{ws_addr}/chat"), tunnel)
        .await
        .unwrap();
    assert_eq!(response.headers()["x-passeur-websocket"], "true");

    for i in 0..5 {
        ws.send(Message::text(i.to_string())).await.unwrap();
    }
    for i in 0..5 {
        let message = ws.next().await.unwrap().unwrap();
        assert_eq!(message.to_text().unwrap(), i.to_string());
    }
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn reload_swaps_the_rule_for_later_requests() {
    let origin = upstream(None, |_| reply("allowed")).await;
    let path = std::env::temp_dir().join(format!("passeur-reload-{}.rules", std::process::id()));
    std::fs::write(&path, "=unrelated.example -> deny\n").unwrap();

    let settings = Settings {
        rule_file: Some(path.clone()),
        ..Settings::default()
    };
    let rule = crate::state::init(&settings).unwrap().rule;
    let rule_path = path.clone();
    let proxy = start_proxy(rule, move |s| s.rule_file = Some(rule_path)).await;
    let url = format!("http://{}/", origin.addr);

    let (status, _, _) = send(proxy.addr, &url).await;
    assert_eq!(status, StatusCode::OK);

    std::fs::write(&path, "=127.0.0.1 -> deny\n").unwrap();
    let (status, _, body) = send(proxy.addr, "/__passeur/api/reload_rule").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"refresh user rule");

    let (status, _, _) = send(proxy.addr, &url).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn origin_form_requests_are_not_proxied() {
    let proxy = start_proxy(Arc::new(DefaultRule), |_| {}).await;
    let (status, _, _) = send(proxy.addr, "/some/page").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn close_endpoint_stops_the_proxy() {
    let proxy = start_proxy(Arc::new(DefaultRule), |_| {}).await;
    assert_eq!(proxy.handle.status(), ProxyStatus::Ready);

    let (status, _, body) = send(proxy.addr, "/__passeur/api/close").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"passeur close");

    tokio::time::timeout(Duration::from_secs(5), proxy.run).await.unwrap().unwrap();
    assert_eq!(proxy.handle.status(), ProxyStatus::Closed);
    assert!(TcpStream::connect(proxy.addr).await.is_err());
}

#[tokio::test]
async fn web_assets_cannot_escape_the_web_root() {
    let outside = std::env::temp_dir().join(format!("passeur-outside-{}.txt", std::process::id()));
    std::fs::write(&outside, "secret").unwrap();
    let root = std::env::temp_dir().join(format!("passeur-web-{}", std::process::id()));
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("index.html"), "<p>ui</p>").unwrap();

    let web_root = root.clone();
    let proxy = start_proxy(Arc::new(DefaultRule), move |s| s.web_root = Some(web_root)).await;

    let (status, _, body) = send(proxy.addr, "/__passeur/web/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"<p>ui</p>");

    // The absolute path leaves an empty segment after `web/`.
    let (status, _, body) = send(proxy.addr, &format!("/__passeur/web/{}", outside.display())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"Not found\n");

    let (status, _, _) = send(proxy.addr, "/__passeur/web/../index.html").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let _ = std::fs::remove_file(&outside);
    let _ = std::fs::remove_dir_all(&root);
}
