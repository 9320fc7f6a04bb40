//! SOCKS5 client side of an upstream tunnel

use crate::error::Result;
use bridge_rules::ProxyConfig;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

/// Run the SOCKS5 greeting and CONNECT over an already connected socket.
///
/// Username/password authentication needs a non-empty username; a
/// password-only upstream (`ip:port:password`) is offered no-auth.
pub async fn establish(
    socket: TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<Socks5Stream<TcpStream>> {
    if proxy.username.is_empty() && !proxy.password.is_empty() {
        debug!(proxy = %proxy.endpoint(), "No SOCKS5 username, offering no-auth");
    }

    let stream = if !proxy.username.is_empty() {
        Socks5Stream::connect_with_password_and_socket(
            socket,
            (host, port),
            &proxy.username,
            &proxy.password,
        )
        .await?
    } else {
        Socks5Stream::connect_with_socket(socket, (host, port)).await?
    };
    Ok(stream)
}
