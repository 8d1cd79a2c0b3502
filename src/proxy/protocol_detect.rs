/// What a client sent first through an established CONNECT tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectedProtocol {
    Tls,
    /// Plaintext HTTP; `method` is the request method.
    Http { method: String },
    Unknown,
}

impl DetectedProtocol {
    /// A plaintext `GET` through CONNECT is how clients open unencrypted
    /// WebSockets via a proxy.
    pub fn is_plain_websocket_bootstrap(&self) -> bool {
        matches!(self, DetectedProtocol::Http { method } if method == "GET")
    }
}

pub fn detect_protocol(first_bytes: &[u8]) -> DetectedProtocol {
    if first_bytes.len() >= 2 && first_bytes[0] == 0x16 && first_bytes[1] == 0x03 {
        return DetectedProtocol::Tls;
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(first_bytes) {
        // A partial parse still yields the method once the request line has started.
        Ok(_) | Err(httparse::Error::TooManyHeaders) => match request.method {
            Some(method) if first_bytes.starts_with(format!("{method} ").as_bytes()) => {
                DetectedProtocol::Http { method: method.to_owned() }
            }
            _ => DetectedProtocol::Unknown,
        },
        Err(_) => DetectedProtocol::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_is_tls() {
        assert_eq!(detect_protocol(&[0x16, 0x03, 0x01, 0x02, 0x00]), DetectedProtocol::Tls);
    }

    #[test]
    fn plaintext_get_is_a_websocket_bootstrap() {
        let detected = detect_protocol(b"GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\r\n");
        assert!(detected.is_plain_websocket_bootstrap());
    }

    #[test]
    fn partial_request_line_is_enough() {
        assert_eq!(
            detect_protocol(b"POST /upl"),
            DetectedProtocol::Http { method: "POST".to_owned() }
        );
        assert!(!detect_protocol(b"POST /upl").is_plain_websocket_bootstrap());
    }

    #[test]
    fn binary_noise_is_unknown() {
        assert_eq!(detect_protocol(&[0x00, 0xff, 0x13]), DetectedProtocol::Unknown);
    }
}
