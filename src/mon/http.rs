use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::trace;
use hyper::client::connect::dns::Name;
use reqwest::dns::{Addrs, Resolve, Resolving};
use reqwest::redirect::Policy;
use reqwest::{Client, Method};
use tokio::time::interval;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const SWEEP_INTERVAL: Duration = Duration::from_secs(20);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// Resolves every hostname to one fixed address, so a probe dials the
// destination IP while the URL keeps the configured host for the Host
// header and SNI.
struct FixedResolver(IpAddr);

impl Resolve for FixedResolver {
    fn resolve(&self, _name: Name) -> Resolving {
        let addr = SocketAddr::new(self.0, 0);
        Box::pin(async move { Ok(Box::new(std::iter::once(addr)) as Addrs) })
    }
}

struct Entry {
    client: Client,
    last_used: Instant,
}

/// Cache of one HTTP client per destination IP. Clients idle for over a
/// minute are evicted by a periodic sweeper; the drop (which closes the
/// connection pool) happens outside the cache lock.
pub(crate) struct ClientCache {
    entries: Mutex<HashMap<IpAddr, Entry>>,
}

impl ClientCache {
    pub(crate) fn new() -> Arc<ClientCache> {
        Arc::new(ClientCache {
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn client(&self, addr: IpAddr) -> reqwest::Result<Client> {
        let mut entries = self.entries.lock().expect("client cache lock");

        if let Some(entry) = entries.get_mut(&addr) {
            entry.last_used = Instant::now();
            return Ok(entry.client.clone());
        }

        let client = ip_client(addr)?;
        entries.insert(
            addr,
            Entry {
                client: client.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(client)
    }

    fn sweep(&self) {
        let mut evicted = Vec::new();
        {
            let mut entries = self.entries.lock().expect("client cache lock");
            let now = Instant::now();
            entries.retain(|addr, entry| {
                if now.duration_since(entry.last_used) > IDLE_TIMEOUT {
                    trace!("Expiring HTTP client for {}", addr);
                    evicted.push(entry.client.clone());
                    false
                } else {
                    true
                }
            });
        }
        // dropped here, after the lock is released
        drop(evicted);
    }
}

/// The sweeper holds only a weak reference, so it winds down when the
/// owning monitor goes away.
pub(crate) fn spawn_sweeper(cache: &Arc<ClientCache>) {
    let cache = Arc::downgrade(cache) as Weak<ClientCache>;
    tokio::spawn(async move {
        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match cache.upgrade() {
                Some(cache) => cache.sweep(),
                None => return,
            }
        }
    });
}

fn ip_client(addr: IpAddr) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .redirect(Policy::none())
        .dns_resolver(Arc::new(FixedResolver(addr)))
        .build()
}

// Format an address for the host portion of a URL: IPv6 gets brackets,
// and any zone separator is escaped per RFC 6874.
fn ip_host(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(addr) => addr.to_string(),
        IpAddr::V6(addr) => format!("[{}]", addr.to_string().replace('%', "%25")),
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn probe(
    cache: &ClientCache,
    addr: IpAddr,
    port: u16,
    https: bool,
    head: bool,
    host: &str,
    path: &str,
    expect: &[u16],
) -> (bool, String) {
    if port == 0 {
        return (false, "Port is 0".to_string());
    }

    let client = match cache.client(addr) {
        Ok(client) => client,
        Err(e) => return (false, e.to_string()),
    };

    let scheme = if https { "https" } else { "http" };
    let method = if head { Method::HEAD } else { Method::GET };

    let path = path.strip_prefix('/').unwrap_or(path);

    let host = if host.is_empty() {
        ip_host(addr)
    } else {
        host.to_string()
    };

    // elide default ports from the URL
    let url = if (https && port == 443) || (!https && port == 80) {
        format!("{}://{}/{}", scheme, host, path)
    } else {
        format!("{}://{}:{}/{}", scheme, host, port, path)
    };

    let request = match client.request(method.clone(), url.as_str()).build() {
        Ok(request) => request,
        Err(e) => return (false, e.to_string()),
    };

    let response = match client.execute(request).await {
        Ok(response) => response,
        Err(e) => return (false, e.to_string()),
    };

    let status = response.status();
    let _ = response.bytes().await; // drain the body

    let expect = if expect.is_empty() { &[200][..] } else { expect };

    for code in expect {
        if *code == 0 || status.as_u16() == *code {
            return (true, format_status(status));
        }
    }

    (false, format!("{} {} - {}", method, url, format_status(status)))
}

fn format_status(status: reqwest::StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_host() {
        assert_eq!(ip_host("10.0.0.1".parse().unwrap()), "10.0.0.1");
        assert_eq!(ip_host("2001:db8::1".parse().unwrap()), "[2001:db8::1]");
    }

    #[tokio::test]
    async fn test_zero_port_fails_fast() {
        let cache = ClientCache::new();
        let (ok, diagnostic) =
            probe(&cache, "10.0.0.1".parse().unwrap(), 0, false, false, "", "", &[]).await;
        assert!(!ok);
        assert_eq!(diagnostic, "Port is 0");
    }

    #[tokio::test]
    async fn test_probe_against_local_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let status = if request.starts_with("GET /missing") {
                        "404 Not Found"
                    } else {
                        "200 OK"
                    };
                    let response =
                        format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        let cache = ClientCache::new();
        let addr: IpAddr = "127.0.0.1".parse().unwrap();

        let (ok, diagnostic) = probe(&cache, addr, port, false, false, "", "/", &[]).await;
        assert!(ok, "expected 200 to pass: {}", diagnostic);
        assert_eq!(diagnostic, "200 OK");

        let (ok, _) = probe(&cache, addr, port, false, false, "", "/missing", &[]).await;
        assert!(!ok, "404 against default expectations fails");

        let (ok, _) = probe(&cache, addr, port, false, false, "", "/missing", &[404]).await;
        assert!(ok, "404 passes when expected");

        let (ok, _) = probe(&cache, addr, port, false, false, "", "/missing", &[0]).await;
        assert!(ok, "0 matches any status");

        // the host header goes through the fixed resolver to the same IP
        let (ok, _) = probe(&cache, addr, port, false, false, "healthcheck.example", "/", &[]).await;
        assert!(ok, "hostname is pinned to the destination address");
    }

    #[tokio::test]
    async fn test_connection_refused_diagnostic() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cache = ClientCache::new();
        let (ok, diagnostic) =
            probe(&cache, "127.0.0.1".parse().unwrap(), port, false, false, "", "", &[]).await;
        assert!(!ok);
        assert!(!diagnostic.is_empty());
    }

    #[test]
    fn test_sweeper_evicts_idle_clients() {
        let cache = ClientCache::new();
        let _ = cache.client("10.0.0.1".parse().unwrap()).unwrap();

        {
            let mut entries = cache.entries.lock().unwrap();
            let entry = entries.get_mut(&"10.0.0.1".parse().unwrap()).unwrap();
            entry.last_used = Instant::now() - Duration::from_secs(120);
        }

        cache.sweep();
        assert!(cache.entries.lock().unwrap().is_empty());
    }
}
