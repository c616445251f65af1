use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};

use super::session::{Session, SessionStatus};
use super::{BgpNotify, Parameters};

type StatusReply = oneshot::Sender<HashMap<String, SessionStatus>>;

/// Manages one `Session` per configured peer and fans RIB changes out to
/// all of them. A control task owns the session map; the handle's methods
/// are channel sends, so they never block on a slow peer.
pub struct Pool {
    configure: mpsc::Sender<HashMap<String, Parameters>>,
    rib: mpsc::Sender<Vec<IpAddr>>,
    status: mpsc::Sender<StatusReply>,
}

impl Pool {
    /// `router_id` also serves as the BGP identifier in OPEN messages; an
    /// unspecified router id is rejected.
    pub fn new(
        router_id: Ipv4Addr,
        peers: HashMap<String, Parameters>,
        rib: Vec<IpAddr>,
        logs: Option<Arc<dyn BgpNotify>>,
    ) -> Option<Pool> {
        if router_id.is_unspecified() {
            return None;
        }

        let (configure_tx, configure_rx) = mpsc::channel(1);
        let (rib_tx, rib_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = mpsc::channel(1);

        tokio::spawn(run(router_id, peers, rib, logs, configure_rx, rib_rx, status_rx));

        Some(Pool {
            configure: configure_tx,
            rib: rib_tx,
            status: status_tx,
        })
    }

    /// Reconcile the set of peers: new entries are started, existing ones
    /// reconfigured, and sessions for peers absent from the map are shut
    /// down.
    pub async fn configure(&self, peers: HashMap<String, Parameters>) {
        let _ = self.configure.send(peers).await;
    }

    /// Broadcast a new set of addresses to advertise to every session.
    pub async fn rib(&self, addrs: Vec<IpAddr>) {
        let _ = self.rib.send(addrs).await;
    }

    pub async fn status(&self) -> HashMap<String, SessionStatus> {
        let (tx, rx) = oneshot::channel();
        if self.status.send(tx).await.is_err() {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Close every session and stop the control task. Dropping the pool
    /// has the same effect.
    pub fn close(self) {}
}

async fn run(
    router_id: Ipv4Addr,
    peers: HashMap<String, Parameters>,
    mut rib: Vec<IpAddr>,
    logs: Option<Arc<dyn BgpNotify>>,
    mut configure_rx: mpsc::Receiver<HashMap<String, Parameters>>,
    mut rib_rx: mpsc::Receiver<Vec<IpAddr>>,
    mut status_rx: mpsc::Receiver<StatusReply>,
) {
    let mut sessions: HashMap<String, Session> = HashMap::new();

    // reconfigure existing sessions and drop those absent from the map
    async fn reconcile(
        router_id: Ipv4Addr,
        sessions: &mut HashMap<String, Session>,
        rib: &[IpAddr],
        mut peers: HashMap<String, Parameters>,
        logs: &Option<Arc<dyn BgpNotify>>,
    ) {
        let existing: Vec<String> = sessions.keys().cloned().collect();
        for peer in existing {
            match peers.remove(&peer) {
                Some(params) => {
                    if let Some(session) = sessions.get_mut(&peer) {
                        session.configure(params).await;
                    }
                }
                None => {
                    // dropping the session sends CEASE/ADMINISTRATIVE_SHUTDOWN
                    debug!("Deleted peer {}", peer);
                    if let Some(removed) = sessions.remove(&peer) {
                        if let Some(logs) = logs {
                            logs.bgp_peer(&peer, removed.parameters(), false);
                        }
                    }
                }
            }
        }

        for (peer, params) in peers {
            info!("New peer {}", peer);
            if let Some(logs) = logs {
                logs.bgp_peer(&peer, &params, true);
            }
            sessions.insert(
                peer.clone(),
                Session::new(router_id, &peer, params, rib.to_vec(), logs.clone()),
            );
        }
    }

    // initial peers go through the same path as reconfigurations
    reconcile(router_id, &mut sessions, &rib, peers, &logs).await;

    loop {
        tokio::select! {
            reply = status_rx.recv() => {
                match reply {
                    Some(reply) => {
                        let status = sessions
                            .iter()
                            .map(|(peer, session)| (peer.clone(), session.status()))
                            .collect();
                        let _ = reply.send(status);
                    }
                    // handle dropped: close every session and exit
                    None => return,
                }
            }

            addrs = rib_rx.recv() => {
                match addrs {
                    Some(addrs) => {
                        rib = addrs;
                        for session in sessions.values_mut() {
                            session.rib(rib.clone()).await;
                        }
                    }
                    None => return,
                }
            }

            peers = configure_rx.recv() => {
                match peers {
                    Some(peers) => reconcile(router_id, &mut sessions, &rib, peers, &logs).await,
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_unspecified_router_id() {
        assert!(Pool::new(Ipv4Addr::UNSPECIFIED, HashMap::new(), vec![], None).is_none());
    }

    #[tokio::test]
    async fn test_peer_lifecycle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();

        let params = Parameters {
            as_number: 65001,
            hold_time: 30,
            ..Default::default()
        };

        let pool = Pool::new(
            Ipv4Addr::new(10, 0, 0, 1),
            HashMap::from([(peer.clone(), params.clone())]),
            vec!["192.168.0.1".parse().unwrap()],
            None,
        )
        .unwrap();

        // the session dials us
        let (_stream, _) = listener.accept().await.unwrap();

        let status = pool.status().await;
        assert_eq!(status.len(), 1);
        assert!(status.contains_key(&peer));

        // removing the peer from the map tears the session down
        pool.configure(HashMap::new()).await;
        let status = pool.status().await;
        assert!(status.is_empty());

        pool.close();
    }

    #[tokio::test]
    async fn test_rib_broadcast() {
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::Framed;

        use super::super::codec::MessageCodec;
        use super::super::message::{Message, Open, Update};
        use super::super::M_UPDATE;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();

        let params = Parameters {
            as_number: 65001,
            hold_time: 90,
            next_hop4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..Default::default()
        };
        let pool = Pool::new(
            Ipv4Addr::new(10, 0, 0, 1),
            HashMap::from([(peer.clone(), params)]),
            vec![],
            None,
        )
        .unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut remote = Framed::new(stream, MessageCodec::new());

        match remote.next().await {
            Some(Ok(Message::Open(_))) => (),
            other => panic!("expected OPEN, got {:?}", other),
        }
        remote
            .send(Message::Open(Open::new(65000, 90, Ipv4Addr::new(10, 0, 0, 2), false)))
            .await
            .unwrap();

        // the empty initial RIB produces no UPDATE; push an address through
        // the pool and it reaches the peer
        pool.rib(vec!["192.168.0.1".parse().unwrap()]).await;

        let update = loop {
            match remote.next().await {
                Some(Ok(Message::Other { mtype, body })) if mtype == M_UPDATE => {
                    break Update::parse(&body).unwrap()
                }
                Some(Ok(_)) => continue,
                other => panic!("peer read failed: {:?}", other),
            }
        };
        assert_eq!(update.announced, vec![Ipv4Addr::new(192, 168, 0, 1)]);

        // stats land just after the transmit; poll briefly
        let mut prefixes = 0;
        for _ in 0..50 {
            prefixes = pool.status().await[&peer].prefixes;
            if prefixes == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(prefixes, 1);

        pool.close();
    }

    #[tokio::test]
    async fn test_status_after_close() {
        let pool = Pool::new(Ipv4Addr::new(10, 0, 0, 1), HashMap::new(), vec![], None).unwrap();
        let status = pool.status().await;
        assert!(status.is_empty());
    }
}
