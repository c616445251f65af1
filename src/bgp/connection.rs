use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr};

use futures::SinkExt;
use log::trace;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{timeout, Duration};

use super::codec::{MessageCodec, MessageProtocol};
use super::message::Message;

const BGP_PORT: u16 = 179;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_DEADLINE: Duration = Duration::from_secs(3);

/// Dial `peer:179`, binding the configured source address when one is
/// given. The peer is a string so that hostnames and zoned link-local
/// addresses resolve through the OS.
pub(crate) async fn connect(source: Option<IpAddr>, peer: &str) -> Result<MessageProtocol> {
    let addr = resolve(peer).await?;

    let stream = timeout(CONNECT_TIMEOUT, dial(source, addr))
        .await
        .map_err(|_| Error::new(ErrorKind::TimedOut, "Connect timed out"))??;

    trace!("Connected to {}", addr);
    Ok(MessageProtocol::new(stream, MessageCodec::new()))
}

async fn resolve(peer: &str) -> Result<SocketAddr> {
    // "host:port" overrides the well-known port, mostly useful for tests
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = peer.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, BGP_PORT));
    }
    lookup_host((peer, BGP_PORT))
        .await?
        .next()
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("No address for {}", peer)))
}

async fn dial(source: Option<IpAddr>, addr: SocketAddr) -> Result<TcpStream> {
    match source {
        None => TcpStream::connect(addr).await,
        Some(ip) => {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4()?,
                SocketAddr::V6(_) => TcpSocket::new_v6()?,
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            socket.connect(addr).await
        }
    }
}

/// Transmit messages in order, each write capped by the 3-second deadline.
/// `Framed::send` flushes, so on return everything queued has hit the
/// socket or the session is dead.
pub(crate) async fn send<I>(protocol: &mut MessageProtocol, messages: I) -> Result<()>
where
    I: IntoIterator<Item = Message>,
{
    for message in messages {
        timeout(WRITE_DEADLINE, protocol.send(message))
            .await
            .map_err(|_| Error::new(ErrorKind::TimedOut, "Write deadline exceeded"))??;
    }
    Ok(())
}
