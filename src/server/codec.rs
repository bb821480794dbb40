use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::{Instant, timeout};

#[derive(Clone, Debug)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name_string = name.into();
        let lower_name = name_string.to_ascii_lowercase();
        Self {
            name: name_string,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    headers: Vec<HeaderLine>,
    pub head_bytes: usize,
}

impl RequestHead {
    /// First value of the header with the given lowercase name.
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    fn has_connection_token(&self, token: &str) -> bool {
        self.header("connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    /// Whether the connection may serve another request after this one.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::HTTP_11 => !self.has_connection_token("close"),
            _ => false,
        }
    }
}

/// Reads one request head, or `None` if the client closed the connection
/// before sending anything. The whole head shares one deadline and one byte
/// budget.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    client_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_header_bytes > 0, "header size limit must be positive");
    let deadline = Instant::now() + client_timeout;

    let Some((request_line, request_line_bytes)) =
        read_crlf_line(reader, peer, deadline, max_header_bytes).await?
    else {
        return Ok(None);
    };
    if request_line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let mut parts = request_line.split_whitespace();
    let method_text = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?
        .to_string();
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some(other) => bail!("invalid HTTP version '{other}'"),
        None => bail!("malformed request line: missing version"),
    };
    let method = Method::from_bytes(method_text.as_bytes())
        .with_context(|| format!("invalid method '{method_text}'"))?;

    let mut headers = Vec::new();
    let mut head_bytes = request_line_bytes;
    loop {
        let remaining = max_header_bytes
            .checked_sub(head_bytes)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("request head from {peer} exceeds configured limit"))?;
        let Some((line, consumed)) = read_crlf_line(reader, peer, deadline, remaining).await?
        else {
            bail!("connection closed inside request headers from {peer}");
        };
        head_bytes += consumed;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from {peer}"))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("empty header name from {peer}");
        }
        headers.push(HeaderLine::new(name, value.trim()));
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
        head_bytes,
    }))
}

/// Reads one CRLF-terminated line within a deadline and a length budget.
/// Returns `None` on a clean close before the first byte.
async fn read_crlf_line<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_len: usize,
) -> Result<Option<(String, usize)>>
where
    S: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut total = 0usize;

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("timed out reading request from {peer}"))?;
        let available = timeout(remaining, reader.fill_buf())
            .await
            .map_err(|_| anyhow!("timed out reading request from {peer}"))?
            .with_context(|| format!("failed reading request from {peer}"))?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());
        if total + consume > max_len {
            bail!("request line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);
        total += consume;
        if newline_pos.is_some() {
            break;
        }
    }

    let mut line = String::from_utf8(collected)
        .map_err(|_| anyhow!("request line from {peer} contained invalid bytes"))?;
    line.pop();
    if line.ends_with('\r') {
        line.pop();
    }
    Ok(Some((line, total)))
}

/// Replaces a status the client's HTTP version cannot carry, or one without
/// a registered reason phrase, with 500. Always resolves to a concrete,
/// emittable response.
pub fn effective_status(version: Version, status: StatusCode) -> StatusCode {
    if status.canonical_reason().is_none() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    if version == Version::HTTP_10
        && matches!(
            status,
            StatusCode::PARTIAL_CONTENT | StatusCode::RANGE_NOT_SATISFIABLE
        )
    {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    status
}

fn version_text(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Encodes a response head. `status` must already have passed
/// [`effective_status`].
pub fn encode_response_head(
    version: Version,
    status: StatusCode,
    headers: &[(&str, String)],
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(version_text(version).as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buffer.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        buffer.extend_from_slice(name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(b"\r\n");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[tokio::test]
    async fn parses_request_head_with_headers() {
        let raw = b"GET /assets/app.js HTTP/1.1\r\nHost: localhost\r\nRange: bytes=0-9\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader, peer(), Duration::from_secs(1), 1024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/assets/app.js");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.header("range"), Some("bytes=0-9"));
        assert!(head.keep_alive());
    }

    #[tokio::test]
    async fn http10_and_connection_close_disable_keep_alive() {
        let raw = b"GET / HTTP/1.0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader, peer(), Duration::from_secs(1), 1024)
            .await
            .unwrap()
            .unwrap();
        assert!(!head.keep_alive());

        let raw = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader, peer(), Duration::from_secs(1), 1024)
            .await
            .unwrap()
            .unwrap();
        assert!(!head.keep_alive());
    }

    #[tokio::test]
    async fn eof_before_request_yields_none() {
        let raw = b"";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader, peer(), Duration::from_secs(1), 1024)
            .await
            .unwrap();
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        let raw = b"GET / HTTP/2.0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let err = read_request_head(&mut reader, peer(), Duration::from_secs(1), 1024)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid HTTP version"));
    }

    #[tokio::test]
    async fn enforces_header_budget() {
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(2048));
        let mut reader = BufReader::new(raw.as_bytes());
        let err = read_request_head(&mut reader, peer(), Duration::from_secs(1), 256)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("limit"), "unexpected error: {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_on_partial_request_line() {
        let (mut client, server) = tokio::io::duplex(64);
        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            read_request_head(&mut reader, peer(), Duration::from_millis(50), 1024).await
        });

        tokio::task::yield_now().await;
        client.write_all(b"GET / HTTP/1.1").await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(100)).await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(
            err.to_string().contains("timed out"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn effective_status_passes_known_codes() {
        assert_eq!(
            effective_status(Version::HTTP_11, StatusCode::PARTIAL_CONTENT),
            StatusCode::PARTIAL_CONTENT
        );
        assert_eq!(
            effective_status(Version::HTTP_10, StatusCode::OK),
            StatusCode::OK
        );
    }

    #[test]
    fn effective_status_downgrades_incompatible_codes() {
        assert_eq!(
            effective_status(Version::HTTP_10, StatusCode::PARTIAL_CONTENT),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let exotic = StatusCode::from_u16(599).unwrap();
        assert_eq!(
            effective_status(Version::HTTP_11, exotic),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn encodes_response_head() {
        let head = encode_response_head(
            Version::HTTP_11,
            StatusCode::PARTIAL_CONTENT,
            &[
                ("Content-Range", "bytes 0-9/100".to_string()),
                ("Content-Length", "10".to_string()),
            ],
        );
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.contains("Content-Range: bytes 0-9/100\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
