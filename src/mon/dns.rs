use std::io::{Error, ErrorKind, Result};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use byteorder::{ByteOrder, NetworkEndian};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

const QUERY_NAME: &str = "healthcheck.";
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

static QUERY_ID: AtomicU16 = AtomicU16::new(0x1e7);

/// A-query the server at `addr:port`; any well-formed response with
/// RCODE 0 passes. `tcp` selects the transport.
pub(crate) async fn probe(addr: IpAddr, port: u16, tcp: bool) -> (bool, String) {
    let attempt = if tcp {
        timeout(QUERY_TIMEOUT, query_tcp(addr, port)).await
    } else {
        timeout(QUERY_TIMEOUT, query_udp(addr, port)).await
    };

    match attempt {
        Err(_) => (false, "Timed out".to_string()),
        Ok(Err(e)) => (false, e.to_string()),
        Ok(Ok(result)) => result,
    }
}

fn build_query(id: u16) -> Result<Vec<u8>> {
    let name = Name::from_ascii(QUERY_NAME)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.to_string()))?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));

    message
        .to_vec()
        .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))
}

fn check_response(data: &[u8], id: u16) -> (bool, String) {
    let response = match Message::from_vec(data) {
        Ok(response) => response,
        Err(e) => return (false, e.to_string()),
    };

    if response.id() != id {
        return (false, "Response ID mismatch".to_string());
    }

    if response.message_type() != MessageType::Response {
        return (false, "Not a response".to_string());
    }

    let rcode = response.response_code();
    if rcode == ResponseCode::NoError {
        (true, rcode.to_string())
    } else {
        (false, rcode.to_string())
    }
}

async fn query_udp(addr: IpAddr, port: u16) -> Result<(bool, String)> {
    let id = QUERY_ID.fetch_add(1, Ordering::Relaxed);
    let query = build_query(id)?;

    let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect((addr, port)).await?;
    socket.send(&query).await?;

    let mut buf = [0u8; 512];
    let n = socket.recv(&mut buf).await?;
    Ok(check_response(&buf[..n], id))
}

async fn query_tcp(addr: IpAddr, port: u16) -> Result<(bool, String)> {
    let id = QUERY_ID.fetch_add(1, Ordering::Relaxed);
    let query = build_query(id)?;

    let mut stream = TcpStream::connect((addr, port)).await?;

    let mut framed = vec![0u8; 2 + query.len()];
    NetworkEndian::write_u16(&mut framed[..2], query.len() as u16);
    framed[2..].copy_from_slice(&query);
    stream.write_all(&framed).await?;

    let mut length = [0u8; 2];
    stream.read_exact(&mut length).await?;
    let length = NetworkEndian::read_u16(&length) as usize;

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(check_response(&body, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    // a minimal DNS server for one query
    fn answer(request: &[u8], rcode: ResponseCode) -> Vec<u8> {
        let request = Message::from_vec(request).unwrap();
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(rcode);
        for query in request.queries() {
            response.add_query(query.clone());
        }
        response.to_vec().unwrap()
    }

    #[tokio::test]
    async fn test_udp_probe() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let response = answer(&buf[..n], ResponseCode::NoError);
            server.send_to(&response, from).await.unwrap();
        });

        let (ok, diagnostic) = probe(addr.ip(), addr.port(), false).await;
        assert!(ok, "{}", diagnostic);
    }

    #[tokio::test]
    async fn test_udp_probe_servfail() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let response = answer(&buf[..n], ResponseCode::ServFail);
            server.send_to(&response, from).await.unwrap();
        });

        let (ok, _) = probe(addr.ip(), addr.port(), false).await;
        assert!(!ok, "SERVFAIL must not pass");
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut length = [0u8; 2];
            stream.read_exact(&mut length).await.unwrap();
            let mut body = vec![0u8; NetworkEndian::read_u16(&length) as usize];
            stream.read_exact(&mut body).await.unwrap();

            let response = answer(&body, ResponseCode::NoError);
            let mut framed = vec![0u8; 2 + response.len()];
            NetworkEndian::write_u16(&mut framed[..2], response.len() as u16);
            framed[2..].copy_from_slice(&response);
            stream.write_all(&framed).await.unwrap();
        });

        let (ok, diagnostic) = probe(addr.ip(), addr.port(), true).await;
        assert!(ok, "{}", diagnostic);
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        // a UDP socket that never answers
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let (ok, diagnostic) = probe(addr.ip(), addr.port(), false).await;
        assert!(!ok);
        assert_eq!(diagnostic, "Timed out");
    }
}
