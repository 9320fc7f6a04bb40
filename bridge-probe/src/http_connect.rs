//! HTTP CONNECT client side of an upstream tunnel

use crate::error::{ProbeError, Result};
use base64::Engine;
use bridge_rules::ProxyConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on the proxy's response headers
const MAX_HEADER_BYTES: usize = 16384;

/// Build the CONNECT request for `host:port`, with Basic auth when configured
pub fn connect_request(proxy: &ProxyConfig, host: &str, port: u16) -> String {
    let authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if proxy.has_credentials() {
        let cred = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", proxy.username, proxy.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", cred));
    }
    request.push_str("\r\n");
    request
}

/// Send CONNECT over `stream` and wait for a 2xx status.
///
/// Returns the stream positioned after the response headers, plus the
/// status line.
pub async fn establish<S>(stream: S, proxy: &ProxyConfig, host: &str, port: u16) -> Result<(BufReader<S>, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(connect_request(proxy, host, port).as_bytes())
        .await?;
    reader.get_mut().flush().await?;

    let mut status_line = String::new();
    if reader.read_line(&mut status_line).await? == 0 {
        return Err(ProbeError::MalformedResponse(
            "connection closed before response".to_string(),
        ));
    }
    let status_line = status_line.trim().to_string();
    let code = parse_status_code(&status_line)?;

    // Skip remaining headers until the empty line
    let mut consumed = status_line.len();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        consumed += n;
        if consumed > MAX_HEADER_BYTES {
            return Err(ProbeError::MalformedResponse(
                "response headers too large".to_string(),
            ));
        }
    }

    if !(200..300).contains(&code) {
        return Err(ProbeError::HttpConnect { status: status_line });
    }
    Ok((reader, status_line))
}

/// Status code from an `HTTP/1.x NNN reason` line
pub fn parse_status_code(status_line: &str) -> Result<u16> {
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse::<u16>()
            .map_err(|_| ProbeError::MalformedResponse(status_line.to_string())),
        _ => Err(ProbeError::MalformedResponse(status_line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_rules::ProxyKind;

    #[test]
    fn test_connect_request_without_auth() {
        let proxy = ProxyConfig::new(ProxyKind::Http, "1.2.3.4", 8080);
        assert_eq!(
            connect_request(&proxy, "example.com", 443),
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
        );
    }

    #[test]
    fn test_connect_request_with_auth() {
        let proxy =
            ProxyConfig::new(ProxyKind::Http, "1.2.3.4", 8080).with_credentials("user", "pass");
        let request = connect_request(&proxy, "2001:db8::1", 443);
        assert!(request.starts_with("CONNECT [2001:db8::1]:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("HTTP/1.1 200 Connection Established").unwrap(), 200);
        assert_eq!(parse_status_code("HTTP/1.0 407 Proxy Authentication Required").unwrap(), 407);
        assert!(parse_status_code("SSH-2.0-OpenSSH").is_err());
        assert!(parse_status_code("HTTP/1.1 abc").is_err());
    }

    #[tokio::test]
    async fn test_establish_rejects_non_2xx() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = [0u8; 512];
            let _ = server.read(&mut buf).await;
            let _ = server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let proxy = ProxyConfig::new(ProxyKind::Http, "1.2.3.4", 8080);
        let err = establish(client, &proxy, "example.com", 80).await.unwrap_err();
        match err {
            ProbeError::HttpConnect { status } => assert!(status.contains("407")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
