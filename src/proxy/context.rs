use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::{HeaderMap, Method, StatusCode};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// `None` while the body is still being streamed from the client.
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// `None` when the body is relayed as a stream.
    pub body: Option<Bytes>,
}

impl ResponseInfo {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: Some(body.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Timings {
    pub client_start: Option<DateTime<Utc>>,
    pub proxy_start: Option<DateTime<Utc>>,
    pub proxy_end: Option<DateTime<Utc>>,
    pub client_end: Option<DateTime<Utc>>,
}

/// Everything known about one proxied request. Owned by the task handling it
/// and mutated in place by each pipeline stage and rule hook.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub record_id: u64,
    pub client_address: SocketAddr,
    pub protocol: Scheme,
    /// The request as received from the client.
    pub raw_request: RequestInfo,
    /// The request that will be sent upstream; rules may rewrite it.
    pub request: RequestInfo,
    /// The response as received from upstream.
    pub raw_response: Option<ResponseInfo>,
    /// The response that will be sent to the client. Setting it before the
    /// upstream fetch short-circuits the network call.
    pub response: Option<ResponseInfo>,
    /// Buffer the whole request body before forwarding it.
    pub wait_req_data: bool,
    /// Buffer and decode the whole response body before replying.
    pub wait_res_data: bool,
    /// When false, the exchange is relayed verbatim.
    pub deal_request: bool,
    pub dangerously_ignore_unauthorized: bool,
    pub timings: Timings,
}

impl RequestContext {
    pub fn new(
        record_id: u64,
        client_address: SocketAddr,
        protocol: Scheme,
        request: RequestInfo,
        dangerously_ignore_unauthorized: bool,
    ) -> Self {
        Self {
            record_id,
            client_address,
            protocol,
            raw_request: request.clone(),
            request,
            raw_response: None,
            response: None,
            wait_req_data: false,
            wait_res_data: false,
            deal_request: true,
            dangerously_ignore_unauthorized,
            timings: Timings {
                client_start: Some(Utc::now()),
                ..Timings::default()
            },
        }
    }

    pub fn host(&self) -> &str {
        self.request.url.host_str().unwrap_or_default()
    }
}

/// What the rule layer sees of a CONNECT attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectContext {
    pub host: String,
    pub port: Option<u16>,
    pub protocol: Scheme,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsTarget {
    pub headers: HeaderMap,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub secure: bool,
}

impl WsTarget {
    pub fn scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(if self.secure { 443 } else { 80 })
    }

    pub fn url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}{}", self.scheme(), self.host, port, self.path),
            None => format!("{}://{}{}", self.scheme(), self.host, self.path),
        }
    }
}

/// What the rule layer sees of a WebSocket upgrade: the handshake as received
/// and the target the relay will connect to.
#[derive(Debug, Clone)]
pub struct WsContext {
    pub raw: WsTarget,
    pub target: WsTarget,
}
