//! SOCKS5 client for anonymity-network zones
//!
//! Only the no-auth CONNECT command with a domain-name target is used: tor
//! and i2p proxies resolve `.onion`/`.i2p` names themselves.

use super::address::NetworkAddress;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

#[derive(Error, Debug)]
pub enum SocksError {
    #[error("Proxy speaks SOCKS version {0}")]
    BadVersion(u8),
    #[error("Proxy refused every authentication method")]
    NoAcceptableMethod,
    #[error("Proxy reply {0}: {1}")]
    Reply(u8, &'static str),
    #[error("Unsupported bound address type {0}")]
    AddressType(u8),
    #[error("Host name too long for SOCKS: {0}")]
    HostTooLong(String),
    #[error("Connection to proxy timed out")]
    Timeout,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn reply_text(code: u8) -> &'static str {
    match code {
        1 => "general server failure",
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "TTL expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "unknown failure",
    }
}

/// Runs the SOCKS5 handshake on an open stream to the proxy
pub async fn handshake<S>(stream: &mut S, target: &NetworkAddress) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(choice[0]));
    }
    if choice[1] != METHOD_NO_AUTH {
        return Err(SocksError::NoAcceptableMethod);
    }

    let host = target.host_str();
    if host.len() > u8::MAX as usize {
        return Err(SocksError::HostTooLong(host));
    }
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0, ATYP_DOMAIN, host.len() as u8]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(reply[0]));
    }
    if reply[1] != 0 {
        return Err(SocksError::Reply(reply[1], reply_text(reply[1])));
    }
    let bound_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(SocksError::AddressType(other)),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// Connects to `target` through the proxy at `proxy`
pub async fn connect(
    proxy: SocketAddr,
    target: &NetworkAddress,
    timeout: Duration,
) -> Result<TcpStream, SocksError> {
    let attempt = async {
        let mut stream = TcpStream::connect(proxy).await?;
        handshake(&mut stream, target).await?;
        Ok::<_, SocksError>(stream)
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| SocksError::Timeout)?
}
