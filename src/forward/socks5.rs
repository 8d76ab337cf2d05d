//! SOCKS5 front end for dynamic tunnels.
//!
//! Server side of RFC 1928, restricted to the NO-AUTH method and the CONNECT
//! command. Implemented as an explicit parser over read-exact primitives; a
//! malformed request rejects only the offending connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_UNSUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_UNSUPPORTED: u8 = 0x08;

/// Requested CONNECT target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Bracket IPv6 literals the way net.JoinHostPort does.
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Run the SOCKS5 handshake for CONNECT with NO-AUTH only and return the
/// requested target. Protocol rejections send the matching reply before
/// failing; the final success/failure reply for the CONNECT itself is the
/// caller's responsibility once the target dial settles.
pub async fn read_connect_target<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    read_exact(stream, &mut greeting, "read socks5 greeting").await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(Error::protocol(format!(
            "unsupported socks version: {}",
            greeting[0]
        )));
    }

    let method_count = greeting[1] as usize;
    if method_count == 0 {
        return Err(Error::protocol("empty socks5 auth methods"));
    }
    let mut methods = vec![0u8; method_count];
    read_exact(stream, &mut methods, "read socks5 auth methods").await?;

    if !methods.contains(&AUTH_NO_AUTH) {
        let _ = stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await;
        return Err(Error::protocol(
            "socks5 no-auth method is not accepted by client",
        ));
    }
    stream
        .write_all(&[SOCKS_VERSION, AUTH_NO_AUTH])
        .await
        .map_err(|err| Error::protocol(format!("write socks5 auth response failed: {err}")))?;

    let mut header = [0u8; 4];
    read_exact(stream, &mut header, "read socks5 request header").await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::protocol(format!(
            "unsupported socks request version: {}",
            header[0]
        )));
    }

    let cmd = header[1];
    let atyp = header[3];
    if cmd != CMD_CONNECT {
        let _ = write_reply(stream, REPLY_COMMAND_UNSUPPORTED).await;
        return Err(Error::protocol(format!("unsupported socks5 command: {cmd}")));
    }

    let host = match read_address_host(stream, atyp).await {
        Ok(host) => host,
        Err(err) => {
            let _ = write_reply(stream, REPLY_ADDRESS_UNSUPPORTED).await;
            return Err(err);
        }
    };

    let mut port_bytes = [0u8; 2];
    read_exact(stream, &mut port_bytes, "read socks5 target port").await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(TargetAddr { host, port })
}

/// Fixed 10-byte reply with BND.ADDR=0.0.0.0 and BND.PORT=0.
pub async fn write_reply<S>(stream: &mut S, reply: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[
            SOCKS_VERSION,
            reply,
            0x00,
            ATYP_IPV4,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
        ])
        .await
        .map_err(|err| Error::protocol(format!("write socks5 reply failed: {err}")))
}

async fn read_address_host<S>(stream: &mut S, atyp: u8) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut raw = [0u8; 4];
            read_exact(stream, &mut raw, "read socks5 ipv4").await?;
            Ok(std::net::Ipv4Addr::from(raw).to_string())
        }
        ATYP_DOMAIN => {
            let mut size = [0u8; 1];
            read_exact(stream, &mut size, "read socks5 domain length").await?;
            if size[0] == 0 {
                return Err(Error::protocol("invalid socks5 domain length"));
            }
            let mut raw = vec![0u8; size[0] as usize];
            read_exact(stream, &mut raw, "read socks5 domain").await?;
            String::from_utf8(raw)
                .map_err(|err| Error::protocol(format!("invalid socks5 domain: {err}")))
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 16];
            read_exact(stream, &mut raw, "read socks5 ipv6").await?;
            Ok(std::net::Ipv6Addr::from(raw).to_string())
        }
        other => Err(Error::protocol(format!(
            "unsupported socks5 address type: {other}"
        ))),
    }
}

async fn read_exact<S>(stream: &mut S, buf: &mut [u8], what: &str) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|err| Error::protocol(format!("{what} failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_connect_to_domain_target() {
        let (mut client, mut server) = duplex(256);

        let client_side = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");

            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.expect("auth response");
            assert_eq!(resp, [0x05, 0x00]);

            let host = b"example.com";
            let mut request = vec![0x05, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
            request.extend_from_slice(host);
            request.extend_from_slice(&[0x00, 0x50]); // port 80
            client.write_all(&request).await.expect("request");
        });

        let target = read_connect_target(&mut server).await.expect("target");
        assert_eq!(target.to_string(), "example.com:80");
        client_side.await.expect("client task");
    }

    #[tokio::test]
    async fn test_no_acceptable_auth_method() {
        let (mut client, mut server) = duplex(256);

        let client_side = tokio::spawn(async move {
            // Only username/password (0x02) offered.
            client.write_all(&[0x05, 0x01, 0x02]).await.expect("greeting");
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.expect("rejection");
            assert_eq!(resp, [0x05, 0xFF]);
        });

        let err = read_connect_target(&mut server).await.expect_err("must fail");
        assert!(err.to_string().contains("no-auth method"));
        client_side.await.expect("client task");
    }

    #[tokio::test]
    async fn test_unsupported_command_replies_0x07() {
        let (mut client, mut server) = duplex(256);

        let client_side = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.expect("auth response");
            assert_eq!(resp, [0x05, 0x00]);

            // BIND (0x02) is not supported; header only, the parser rejects
            // before reading any address bytes.
            client
                .write_all(&[0x05, 0x02, 0x00, ATYP_IPV4])
                .await
                .expect("request");

            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.expect("reply");
            assert_eq!(reply[0], 0x05);
            assert_eq!(reply[1], REPLY_COMMAND_UNSUPPORTED);
        });

        let err = read_connect_target(&mut server).await.expect_err("must fail");
        assert!(err.to_string().contains("unsupported socks5 command"));
        client_side.await.expect("client task");
    }

    #[tokio::test]
    async fn test_unsupported_address_type_replies_0x08() {
        let (mut client, mut server) = duplex(256);

        let client_side = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.expect("auth response");

            client
                .write_all(&[0x05, CMD_CONNECT, 0x00, 0x09])
                .await
                .expect("request");

            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.expect("reply");
            assert_eq!(reply[1], REPLY_ADDRESS_UNSUPPORTED);
        });

        let err = read_connect_target(&mut server).await.expect_err("must fail");
        assert!(err.to_string().contains("unsupported socks5 address type"));
        client_side.await.expect("client task");
    }

    #[tokio::test]
    async fn test_ipv4_target() {
        let (mut client, mut server) = duplex(256);

        let client_side = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.expect("auth response");

            client
                .write_all(&[0x05, CMD_CONNECT, 0x00, ATYP_IPV4, 10, 0, 0, 7, 0x1F, 0x90])
                .await
                .expect("request");
        });

        let target = read_connect_target(&mut server).await.expect("target");
        assert_eq!(target.host, "10.0.0.7");
        assert_eq!(target.port, 8080);
        client_side.await.expect("client task");
    }

    #[tokio::test]
    async fn test_ipv6_target_display_is_bracketed() {
        let (mut client, mut server) = duplex(256);

        let client_side = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.expect("auth response");

            let mut request = vec![0x05, CMD_CONNECT, 0x00, ATYP_IPV6];
            let addr: std::net::Ipv6Addr = "2001:db8::1".parse().expect("addr");
            request.extend_from_slice(&addr.octets());
            request.extend_from_slice(&[0x01, 0xBB]); // 443
            client.write_all(&request).await.expect("request");
        });

        let target = read_connect_target(&mut server).await.expect("target");
        assert_eq!(target.to_string(), "[2001:db8::1]:443");
        client_side.await.expect("client task");
    }

    #[tokio::test]
    async fn test_zero_length_domain_rejected() {
        let (mut client, mut server) = duplex(256);

        let client_side = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.expect("greeting");
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.expect("auth response");

            client
                .write_all(&[0x05, CMD_CONNECT, 0x00, ATYP_DOMAIN, 0x00])
                .await
                .expect("request");

            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.expect("reply");
            assert_eq!(reply[1], REPLY_ADDRESS_UNSUPPORTED);
        });

        let err = read_connect_target(&mut server).await.expect_err("must fail");
        assert!(err.to_string().contains("invalid socks5 domain length"));
        client_side.await.expect("client task");
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let (mut client, mut server) = duplex(64);
        let client_side = tokio::spawn(async move {
            client.write_all(&[0x04, 0x01]).await.expect("greeting");
        });

        let err = read_connect_target(&mut server).await.expect_err("must fail");
        assert!(err.to_string().contains("unsupported socks version: 4"));
        client_side.await.expect("client task");
    }

    #[tokio::test]
    async fn test_empty_method_list_rejected() {
        let (mut client, mut server) = duplex(64);
        let client_side = tokio::spawn(async move {
            client.write_all(&[0x05, 0x00]).await.expect("greeting");
        });

        let err = read_connect_target(&mut server).await.expect_err("must fail");
        assert!(err.to_string().contains("empty socks5 auth methods"));
        client_side.await.expect("client task");
    }
}
