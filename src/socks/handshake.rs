//! SOCKS5 handshake drivers for both roles
//!
//! The server side runs the inbound greeting/auth/request sequence and
//! hands the target address back to the caller; the reply is sent only
//! after the outbound connection is up, so the bound address is real.
//! The client side performs the full outbound handshake in one call.

use super::{
    write_method_selection, Command, Greeting, Reply, Request, UserPassAuth, AUTH_NO_ACCEPTABLE,
    AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD, REP_COMMAND_NOT_SUPPORTED, SOCKS5_VERSION,
};
use crate::common::NetAddress;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Credential pair required from inbound clients (None = no auth).
#[derive(Debug, Clone)]
pub struct ServerAuth {
    pub username: String,
    pub password: String,
}

/// Run the server-role handshake up to (and including) the request.
///
/// Greeting and optional user/pass subnegotiation are answered here; the
/// final reply is the caller's responsibility via [`Reply`]. Only
/// CONNECT is accepted; other commands are refused with reply code 0x07.
pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    auth: Option<&ServerAuth>,
) -> Result<NetAddress> {
    let greeting = Greeting::read_from(stream).await?;

    match auth {
        Some(expected) => {
            if !greeting.supports(AUTH_USERNAME_PASSWORD) {
                write_method_selection(stream, AUTH_NO_ACCEPTABLE).await?;
                return Err(Error::auth("client offers no acceptable method"));
            }
            write_method_selection(stream, AUTH_USERNAME_PASSWORD).await?;

            let creds = UserPassAuth::read_from(stream).await?;
            if creds.username != expected.username || creds.password != expected.password {
                UserPassAuth::write_result(stream, false).await?;
                return Err(Error::auth("bad username or password"));
            }
            UserPassAuth::write_result(stream, true).await?;
        }
        None => {
            if !greeting.supports(AUTH_NO_AUTH) {
                write_method_selection(stream, AUTH_NO_ACCEPTABLE).await?;
                return Err(Error::auth("client offers no acceptable method"));
            }
            write_method_selection(stream, AUTH_NO_AUTH).await?;
        }
    }

    let request = match Request::read_from(stream).await {
        Ok(request) => request,
        Err(e @ Error::UnsupportedCommand(_)) => {
            Reply::failure(REP_COMMAND_NOT_SUPPORTED)
                .write_to(stream)
                .await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    if request.command != Command::Connect {
        Reply::failure(REP_COMMAND_NOT_SUPPORTED)
            .write_to(stream)
            .await?;
        return Err(Error::UnsupportedCommand(u8::from(request.command)));
    }

    Ok(request.target)
}

/// Client credentials for an upstream SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct ClientAuth {
    pub username: String,
    pub password: String,
}

/// Run the client-role handshake against an upstream SOCKS5 server.
///
/// A non-zero reply code surfaces as `UpstreamRejected`.
pub async fn connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    target: &NetAddress,
    auth: Option<&ClientAuth>,
) -> Result<()> {
    // Greeting
    let greeting: &[u8] = if auth.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_NO_AUTH]
    };
    stream.write_all(greeting).await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != SOCKS5_VERSION {
        return Err(Error::framing("bad version in method selection"));
    }

    match selection[1] {
        AUTH_NO_AUTH => {}
        AUTH_USERNAME_PASSWORD => {
            let auth = auth.ok_or_else(|| Error::auth("server demands credentials"))?;
            if auth.username.len() > 255 || auth.password.len() > 255 {
                return Err(Error::auth("username or password too long"));
            }
            let mut sub = vec![0x01, auth.username.len() as u8];
            sub.extend_from_slice(auth.username.as_bytes());
            sub.push(auth.password.len() as u8);
            sub.extend_from_slice(auth.password.as_bytes());
            stream.write_all(&sub).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::auth("upstream rejected credentials"));
            }
        }
        AUTH_NO_ACCEPTABLE => return Err(Error::auth("no acceptable method")),
        m => return Err(Error::framing(format!("unexpected method {:#04x}", m))),
    }

    // Request
    let mut request = vec![SOCKS5_VERSION, u8::from(Command::Connect), 0x00];
    request.extend_from_slice(&target.to_bytes());
    stream.write_all(&request).await?;

    // Reply: VER | REP | RSV | BND.ADDR | BND.PORT
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::framing("bad version in reply"));
    }
    if head[1] != super::REP_SUCCEEDED {
        return Err(Error::UpstreamRejected(head[1] as u16));
    }
    let bound = NetAddress::read_from(stream).await?;
    debug!("SOCKS5 upstream bound to {}", bound);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_no_auth_connect_handshake() {
        let (mut client, mut server) = duplex(256);
        let target = NetAddress::host_port("127.0.0.1", 80).unwrap();

        let server_task = tokio::spawn(async move {
            let addr = serve(&mut server, None).await.unwrap();
            Reply::success(NetAddress::host_port("127.0.0.1", 9000).unwrap())
                .write_to(&mut server)
                .await
                .unwrap();
            addr
        });

        connect(&mut client, &target, None).await.unwrap();
        let seen = server_task.await.unwrap();
        assert_eq!(seen, target);
    }

    #[tokio::test]
    async fn test_server_rejects_bind() {
        let (mut client, mut server) = duplex(256);
        let server_task = tokio::spawn(async move { serve(&mut server, None).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut sel = [0u8; 2];
        client.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, 0x00]);

        // BIND request
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UnsupportedCommand(0x02)));
    }

    #[tokio::test]
    async fn test_server_no_acceptable_method() {
        let (mut client, mut server) = duplex(64);
        let server_task = tokio::spawn(async move {
            serve(&mut server, Some(&ServerAuth {
                username: "u".into(),
                password: "p".into(),
            }))
            .await
        });

        // Client only offers no-auth while the server wants user/pass
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut sel = [0u8; 2];
        client.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, AUTH_NO_ACCEPTABLE]);

        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_client_upstream_rejected() {
        let (mut client, mut server) = duplex(256);
        let target = NetAddress::host_port("example.com", 443).unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 3];
            server.read_exact(&mut buf[..2]).await.unwrap();
            let n = buf[1] as usize;
            let mut methods = vec![0u8; n];
            server.read_exact(&mut methods).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            // Read request then answer "connection refused"
            let mut head = [0u8; 3];
            server.read_exact(&mut head).await.unwrap();
            let _ = NetAddress::read_from(&mut server).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = connect(&mut client, &target, None).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamRejected(5)));
    }
}
