use http::{Method, Version};

/// Largest request head the mock origin will buffer.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Request line and headers of an inbound HTTP/1.x request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as sent, query string included.
    pub path: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
}

/// Offset of the blank line ending the head, if the buffer holds one.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

impl RequestHead {
    /// Parses a request head (without the terminating blank line).
    /// Returns None for anything that is not a well-formed HTTP/1.x head.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let mut lines = text.split("\r\n");

        let mut parts = lines.next()?.split(' ');
        let method = Method::from_bytes(parts.next()?.as_bytes()).ok()?;
        let path = parts.next()?.to_string();
        let version = match parts.next()? {
            "HTTP/1.0" => Version::HTTP_10,
            "HTTP/1.1" => Version::HTTP_11,
            _ => return None,
        };
        if parts.next().is_some() || path.is_empty() {
            return None;
        }
        if path.bytes().any(|b| b < 0x20 || b == 0x7F) {
            return None;
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':')?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Some(RequestHead {
            method,
            path,
            version,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared body length. A malformed value counts as absent.
    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Whether the client asked to keep the connection open afterwards.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection").map(str::to_ascii_lowercase);
        match self.version {
            Version::HTTP_10 => connection.as_deref() == Some("keep-alive"),
            _ => connection.as_deref() != Some("close"),
        }
    }
}
