#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use memserve::{
    cache::AssetCache,
    cli::LogFormat,
    server::{self, AppContext, content_type::ExtensionContentTypes, resolver::DirectoryResolver},
    settings::Settings,
};

pub struct AssetDirs {
    _temp: TempDir,
    pub root: PathBuf,
}

impl AssetDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let root = temp.path().join("assets");
        std::fs::create_dir_all(&root)?;
        Ok(Self { _temp: temp, root })
    }

    /// Writes one asset under the root, creating intermediate directories.
    pub fn write_asset(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn make_dir(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

/// Deterministic non-repeating byte pattern for byte-exactness assertions.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn default_test_settings(listen: SocketAddr, root: &Path) -> Settings {
    Settings {
        listen,
        root_dir: root.to_path_buf(),
        index_file: "index.html".to_string(),
        log: LogFormat::Text,
        cache_enabled: true,
        cache_capacity: 20 * 1024 * 1024,
        cache_max_entries: 10_000,
        client_timeout: 10,
        max_header_size: 32 * 1024,
        pacing_chunk_percent: 10,
        pacing_attempt_cap: 10,
        metrics_listen: None,
    }
}

pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

pub async fn wait_for_listener(addr: SocketAddr) -> Result<()> {
    for _ in 0..50 {
        match timeout(StdDuration::from_millis(50), TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                stream.shutdown().await.ok();
                return Ok(());
            }
            _ => sleep(StdDuration::from_millis(50)).await,
        }
    }
    Err(anyhow!("listener {addr} did not become ready"))
}

pub struct ServerHarness {
    pub dirs: AssetDirs,
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    pub cache: Option<Arc<AssetCache>>,
    handle: JoinHandle<()>,
}

impl ServerHarness {
    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub struct ServerHarnessBuilder {
    dirs: AssetDirs,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl ServerHarnessBuilder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dirs: AssetDirs::new()?,
            settings_override: None,
        })
    }

    pub fn with_dirs(dirs: AssetDirs) -> Self {
        Self {
            dirs,
            settings_override: None,
        }
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<ServerHarness> {
        let port = find_free_port()?;
        let addr: SocketAddr = format!("127.0.0.1:{port}")
            .parse()
            .expect("valid listen address");

        let mut settings = default_test_settings(addr, &self.dirs.root);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        let addr = settings.listen;
        let settings = Arc::new(settings);

        if let Some(metrics_addr) = settings.metrics_listen {
            tokio::spawn(async move {
                if let Err(err) = memserve::metrics::serve(metrics_addr, "/metrics".to_string()).await
                {
                    tracing::error!(error = ?err, "metrics endpoint failed");
                }
            });
        }

        let cache = if settings.cache_enabled {
            Some(Arc::new(AssetCache::new(
                settings.cache_max_entries,
                settings.cache_capacity,
            )?))
        } else {
            None
        };

        let resolver = Arc::new(DirectoryResolver::new(
            settings.root_dir.clone(),
            settings.index_file.clone(),
        ));
        let app = AppContext::new(
            settings.clone(),
            cache.clone(),
            resolver,
            Arc::new(ExtensionContentTypes),
        );

        let handle = tokio::spawn(async move {
            if let Err(err) = server::run(app).await {
                tracing::error!(error = ?err, "server run failed");
            }
        });

        wait_for_listener(addr).await?;

        Ok(ServerHarness {
            dirs: self.dirs,
            addr,
            settings,
            cache,
            handle,
        })
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name == lower_name)
            .map(|(_, value)| value.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.parse().ok()
    }
}

/// Reads one response head (status line + headers) off the stream.
pub async fn read_response_head(stream: &mut TcpStream) -> Result<Response> {
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = timeout(StdDuration::from_secs(5), stream.read(&mut byte)).await??;
        if bytes == 0 {
            return Err(anyhow!("connection closed before response head completed"));
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8(buffer).context("invalid UTF-8 response head")?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or_else(|| anyhow!("empty response"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in {status_line:?}"))?
        .parse::<u16>()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line {line:?}"))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    Ok(Response {
        status,
        headers,
        body: Vec::new(),
    })
}

/// Reads one full response: head, then exactly `Content-Length` body bytes
/// (none if the header is absent). Leaves the stream usable for keep-alive.
pub async fn read_response(stream: &mut TcpStream) -> Result<Response> {
    let mut response = read_response_head(stream).await?;
    let body_len = response.content_length().unwrap_or(0) as usize;
    let mut body = vec![0u8; body_len];
    timeout(StdDuration::from_secs(10), stream.read_exact(&mut body)).await??;
    response.body = body;
    Ok(response)
}

pub async fn send_request(stream: &mut TcpStream, request: &str) -> Result<()> {
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// One-shot GET over a fresh connection.
pub async fn get(harness: &ServerHarness, target: &str) -> Result<Response> {
    request(harness, "GET", target, &[]).await
}

/// One-shot request over a fresh connection with extra headers.
pub async fn request(
    harness: &ServerHarness,
    method: &str,
    target: &str,
    extra_headers: &[(&str, &str)],
) -> Result<Response> {
    let mut stream = harness.connect().await?;
    let mut text = format!("{method} {target} HTTP/1.1\r\nHost: localhost\r\n");
    for (name, value) in extra_headers {
        text.push_str(&format!("{name}: {value}\r\n"));
    }
    text.push_str("Connection: close\r\n\r\n");
    send_request(&mut stream, &text).await?;
    read_response(&mut stream).await
}
