use std::net::Ipv4Addr;

/// Transport for half-open TCP probes. A real implementation sends a SYN
/// from a raw or packet socket and treats a SYN-ACK (or an RST, reported
/// as "connection refused") as an answer; that machinery lives outside
/// this crate. IPv4 only.
pub trait SynProber: Send + Sync {
    fn check(&self, addr: Ipv4Addr, port: u16) -> (bool, String);
}
