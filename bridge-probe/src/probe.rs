//! End-to-end check of the active upstream proxy
//!
//! Connects to the proxy, opens a tunnel to a target, sends a plain HTTP
//! request through it and reports every stage as human-readable text.

use crate::error::{ProbeError, Result};
use crate::{http_connect, socks5};
use bridge_rules::{ProxyConfig, ProxyKind};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

async fn within<T, F>(limit: Duration, stage: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProbeError::Timeout {
            stage,
            elapsed: limit,
        })?
}

/// A single probe run and its transcript
pub struct Probe<'a> {
    proxy: &'a ProxyConfig,
    timeout: Duration,
    transcript: Vec<String>,
}

impl<'a> Probe<'a> {
    pub fn new(proxy: &'a ProxyConfig) -> Self {
        Self {
            proxy,
            timeout: DEFAULT_TIMEOUT,
            transcript: Vec::new(),
        }
    }

    /// Limit applied to each stage separately
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    fn note(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!("{}", line);
        self.transcript.push(line);
    }

    /// Tunnel to `host:port` and return the target's first response line
    pub async fn run(&mut self, host: &str, port: u16) -> Result<String> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ProbeError::InvalidTarget("empty host".to_string()));
        }
        if port == 0 {
            return Err(ProbeError::InvalidTarget("port must be non-zero".to_string()));
        }

        self.note(format!(
            "Testing {} proxy {} -> {}:{}",
            self.proxy.kind,
            self.proxy.endpoint(),
            host,
            port
        ));

        let endpoint = self.proxy.endpoint();
        let started = Instant::now();
        let socket = within(self.timeout, "connecting to proxy", async {
            TcpStream::connect(&endpoint)
                .await
                .map_err(|source| ProbeError::ProxyUnreachable {
                    endpoint: endpoint.clone(),
                    source,
                })
        })
        .await?;
        self.note(format!(
            "Connected to proxy in {} ms",
            started.elapsed().as_millis()
        ));

        let started = Instant::now();
        let response = match self.proxy.kind {
            ProxyKind::Socks5 => {
                let stream = within(
                    self.timeout,
                    "negotiating SOCKS5",
                    socks5::establish(socket, self.proxy, host, port),
                )
                .await?;
                self.note(format!(
                    "SOCKS5 tunnel established in {} ms",
                    started.elapsed().as_millis()
                ));
                self.exchange(stream, host).await?
            }
            ProxyKind::Http => {
                let (stream, status) = within(
                    self.timeout,
                    "negotiating HTTP CONNECT",
                    http_connect::establish(socket, self.proxy, host, port),
                )
                .await?;
                self.note(format!(
                    "HTTP CONNECT accepted ({}) in {} ms",
                    status,
                    started.elapsed().as_millis()
                ));
                self.exchange(stream, host).await?
            }
        };

        info!(proxy = %self.proxy.endpoint(), target = %host, port, "Proxy test succeeded");
        Ok(response)
    }

    /// Send a minimal HTTP request through the tunnel
    async fn exchange<S>(&mut self, stream: S, host: &str) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: proxybridge-probe\r\nConnection: close\r\n\r\n",
            host
        );

        let started = Instant::now();
        let line = within(self.timeout, "waiting for the target", async {
            reader.get_mut().write_all(request.as_bytes()).await?;
            reader.get_mut().flush().await?;
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            Ok::<_, ProbeError>(line)
        })
        .await?;

        let line = line.trim().to_string();
        if line.is_empty() {
            return Err(ProbeError::MalformedResponse(
                "target closed the tunnel without responding".to_string(),
            ));
        }

        if line.starts_with("HTTP/") {
            self.note(format!(
                "Target responded in {} ms: {}",
                started.elapsed().as_millis(),
                line
            ));
        } else {
            self.note(format!(
                "Target responded in {} ms with non-HTTP data",
                started.elapsed().as_millis()
            ));
        }
        Ok(line)
    }
}

/// Exercise `proxy` against `host:port` and describe the outcome.
///
/// Never fails: errors are part of the returned text.
pub async fn test_connection(proxy: &ProxyConfig, host: &str, port: u16) -> String {
    test_connection_with_timeout(proxy, host, port, DEFAULT_TIMEOUT).await
}

pub async fn test_connection_with_timeout(
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
    timeout: Duration,
) -> String {
    let mut probe = Probe::new(proxy).with_timeout(timeout);
    let outcome = probe.run(host, port).await;

    let mut text = probe.transcript().join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    match outcome {
        Ok(_) => text.push_str("SUCCESS: proxy is working"),
        Err(e) => {
            tracing::warn!(proxy = %proxy.endpoint(), error = %e, "Proxy test failed");
            text.push_str(&format!("ERROR: {}", e));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn read_headers(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            buf.push(byte[0]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// HTTP CONNECT proxy that answers the tunnelled request itself
    async fn fake_http_proxy(connect_reply: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let connect = read_headers(&mut stream).await;
            stream.write_all(connect_reply.as_bytes()).await.unwrap();
            if connect_reply.starts_with("HTTP/1.1 200") {
                read_headers(&mut stream).await;
                stream
                    .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                    .await
                    .unwrap();
            }
            connect
        });
        (port, handle)
    }

    /// SOCKS5 proxy without authentication; yields the target and the
    /// methods the client offered
    async fn fake_socks5_proxy() -> (u16, tokio::task::JoinHandle<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut head = [0u8; 2];
            stream.read_exact(&mut head).await.unwrap();
            let mut methods = vec![0u8; head[1] as usize];
            stream.read_exact(&mut methods).await.unwrap();
            stream.write_all(&[5, 0]).await.unwrap();

            let mut request = [0u8; 4];
            stream.read_exact(&mut request).await.unwrap();
            let target = match request[3] {
                3 => {
                    let mut len = [0u8; 1];
                    stream.read_exact(&mut len).await.unwrap();
                    let mut name = vec![0u8; len[0] as usize];
                    stream.read_exact(&mut name).await.unwrap();
                    String::from_utf8(name).unwrap()
                }
                _ => {
                    let mut addr = [0u8; 4];
                    stream.read_exact(&mut addr).await.unwrap();
                    std::net::Ipv4Addr::from(addr).to_string()
                }
            };
            let mut target_port = [0u8; 2];
            stream.read_exact(&mut target_port).await.unwrap();
            stream
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            read_headers(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            (format!("{}:{}", target, u16::from_be_bytes(target_port)), methods)
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_http_proxy_success_with_auth() {
        let (port, handle) = fake_http_proxy("HTTP/1.1 200 Connection Established\r\n\r\n").await;
        let proxy = ProxyConfig::new(ProxyKind::Http, "127.0.0.1", port)
            .with_credentials("user", "pass");

        let text = test_connection(&proxy, "example.test", 80).await;
        assert!(text.contains("HTTP CONNECT accepted"), "{}", text);
        assert!(text.contains("204 No Content"), "{}", text);
        assert!(text.ends_with("SUCCESS: proxy is working"), "{}", text);

        let connect = handle.await.unwrap();
        assert!(connect.starts_with("CONNECT example.test:80 HTTP/1.1"));
        assert!(connect.contains("Proxy-Authorization: Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn test_http_proxy_rejection_is_reported() {
        let (port, _handle) =
            fake_http_proxy("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;
        let proxy = ProxyConfig::new(ProxyKind::Http, "127.0.0.1", port);

        let text = test_connection(&proxy, "example.test", 80).await;
        assert!(text.contains("Connected to proxy"), "{}", text);
        assert!(text.contains("ERROR: HTTP CONNECT rejected: HTTP/1.1 403 Forbidden"), "{}", text);
    }

    #[tokio::test]
    async fn test_socks5_proxy_success() {
        let (port, handle) = fake_socks5_proxy().await;
        let proxy = ProxyConfig::new(ProxyKind::Socks5, "127.0.0.1", port);

        let mut probe = Probe::new(&proxy);
        let line = probe.run("example.test", 8080).await.unwrap();
        assert_eq!(line, "HTTP/1.1 200 OK");
        assert!(probe.transcript().iter().any(|l| l.starts_with("SOCKS5 tunnel established")));
        assert_eq!(handle.await.unwrap().0, "example.test:8080");
    }

    #[tokio::test]
    async fn test_socks5_password_only_proxy_uses_no_auth() {
        let (port, handle) = fake_socks5_proxy().await;
        let proxy = ProxyConfig::parse(&format!("127.0.0.1:{}:secret", port)).unwrap();
        assert!(proxy.username.is_empty());
        assert_eq!(proxy.password, "secret");

        let text = test_connection(&proxy, "example.test", 80).await;
        assert!(text.ends_with("SUCCESS: proxy is working"), "{}", text);

        let (target, methods) = handle.await.unwrap();
        assert_eq!(target, "example.test:80");
        assert_eq!(methods, vec![0]);
    }

    #[tokio::test]
    async fn test_unreachable_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let proxy = ProxyConfig::new(ProxyKind::Socks5, "127.0.0.1", port);
        let text = test_connection(&proxy, "example.test", 80).await;
        assert!(text.contains("ERROR: Cannot reach proxy 127.0.0.1"), "{}", text);
    }

    #[tokio::test]
    async fn test_silent_target_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let proxy = ProxyConfig::new(ProxyKind::Http, "127.0.0.1", port);
        let text =
            test_connection_with_timeout(&proxy, "example.test", 80, Duration::from_millis(200))
                .await;
        assert!(text.contains("ERROR: Timed out"), "{}", text);
        assert!(text.contains("HTTP CONNECT"), "{}", text);
    }

    #[tokio::test]
    async fn test_invalid_target() {
        let proxy = ProxyConfig::new(ProxyKind::Socks5, "127.0.0.1", 1080);
        let text = test_connection(&proxy, " ", 80).await;
        assert!(text.starts_with("ERROR: Invalid target"), "{}", text);
    }
}
