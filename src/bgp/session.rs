use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, trace, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use super::codec::MessageProtocol;
use super::connection;
use super::hold_timer::HoldTimer;
use super::message::{Message, Notification, Open, UpdateBuilder};
use super::rib::{nlri, Rib};
use super::{note, BgpNotify, Parameters};
use super::{
    ADMINISTRATIVE_SHUTDOWN, BAD_BGP_ID, BAD_MESSAGE_TYPE, CEASE, CONNECTION_FAILED, FSM_ERROR,
    HOLD_TIMER_EXPIRED, INVALID_LOCALIP, MESSAGE_HEADER_ERROR, M_KEEPALIVE, M_UPDATE, OPEN_ERROR,
    OUT_OF_RESOURCES, REMOTE_SHUTDOWN, UNACCEPTABLE_HOLD_TIME, UNSUPPORTED_VERSION_NUMBER,
};

const RETRY_TIME: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    #[default]
    Idle,
    Active,
    Connect,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            State::Idle => "IDLE",
            State::Active => "ACTIVE",
            State::Connect => "CONNECT",
            State::OpenSent => "OPEN_SENT",
            State::OpenConfirm => "OPEN_CONFIRM",
            State::Established => "ESTABLISHED",
        };
        write!(f, "{}", word)
    }
}

/// Read-only view of a session for external observers.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub state: State,
    pub when: DateTime<Utc>,
    #[serde(rename = "duration_s")]
    pub duration: i64,
    #[serde(rename = "update_calculation_ms")]
    pub update_calculation: i64,
    #[serde(rename = "advertised_routes")]
    pub advertised: u64,
    #[serde(rename = "withdrawn_routes")]
    pub withdrawn: u64,
    #[serde(rename = "current_routes")]
    pub prefixes: usize,
    #[serde(rename = "connection_attempts")]
    pub attempts: u64,
    #[serde(rename = "successful_connections")]
    pub connections: u64,
    #[serde(rename = "established_sessions")]
    pub established: u64,
    pub last_error: String,
    pub hold_time: u16,
    pub local_asn: u16,
    pub remote_asn: u16,
    pub adj_rib_out: Vec<String>,
    pub local_ip: String,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus {
            state: State::Idle,
            when: Utc::now(),
            duration: 0,
            update_calculation: 0,
            advertised: 0,
            withdrawn: 0,
            prefixes: 0,
            attempts: 0,
            connections: 0,
            established: 0,
            last_error: String::new(),
            hold_time: 0,
            local_asn: 0,
            remote_asn: 0,
            adj_rib_out: Vec::new(),
            local_ip: String::new(),
        }
    }
}

enum Command {
    Update(Rib),
    Shutdown(String),
}

// How the inner connection attempt ended; drives logging and last_error
enum Exit {
    /// NOTIFICATION received from the peer
    Received(Notification),
    /// We sent this NOTIFICATION and closed
    Sent(Notification),
    /// Administrative shutdown: CEASE sent because the caller closed us
    Shutdown(Notification),
    /// Local failure (code-0 family), nothing on the wire
    Local(u8, String),
}

impl Exit {
    fn describe(&self) -> String {
        fn suffix(data: &[u8]) -> String {
            if data.is_empty() {
                String::new()
            } else {
                format!(" ({})", String::from_utf8_lossy(data))
            }
        }
        match self {
            Exit::Received(n) => format!(
                "Received notification[{}:{}]: {}{}",
                n.code,
                n.sub,
                note(n.code, n.sub),
                suffix(&n.data)
            ),
            Exit::Sent(n) | Exit::Shutdown(n) => format!(
                "Sent notification[{}:{}]: {}{}",
                n.code,
                n.sub,
                note(n.code, n.sub),
                suffix(&n.data)
            ),
            Exit::Local(sub, data) => {
                let mut e = note(0, *sub);
                if !data.is_empty() {
                    e += &format!(" ({})", data);
                }
                e
            }
        }
    }
}

/// One BGP peering. A dedicated task dials the peer, runs the finite state
/// machine and retries failed connections every 30 seconds; the handle
/// feeds it RIB and parameter changes. Dropping the handle (or the pool
/// removing the peer) sends CEASE/ADMINISTRATIVE_SHUTDOWN and ends the
/// task.
pub struct Session {
    updates: mpsc::Sender<Command>,
    parameters: Parameters,
    rib: Vec<IpAddr>,
    status: Arc<Mutex<SessionStatus>>,
}

impl Session {
    pub fn new(
        router_id: Ipv4Addr,
        peer: &str,
        parameters: Parameters,
        rib: Vec<IpAddr>,
        logs: Option<Arc<dyn BgpNotify>>,
    ) -> Session {
        let status = Arc::new(Mutex::new(SessionStatus::default()));
        let (updates, rx) = mpsc::channel(10);

        let initial = Rib::new(parameters.clone(), rib.clone());
        tokio::spawn(run(
            router_id,
            peer.to_string(),
            rx,
            StatusHandle(status.clone()),
            logs,
            initial,
        ));

        Session {
            updates,
            parameters,
            rib,
            status,
        }
    }

    pub(crate) fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn status(&self) -> SessionStatus {
        let mut status = self.status.lock().expect("status lock").clone();
        status.duration = Utc::now().signed_duration_since(status.when).num_seconds();
        status
    }

    /// Replace the set of addresses to advertise.
    pub async fn rib(&mut self, addrs: Vec<IpAddr>) {
        self.rib = addrs;
        self.send_snapshot().await;
    }

    /// Replace the peer parameters.
    pub async fn configure(&mut self, parameters: Parameters) {
        self.parameters = parameters;
        self.send_snapshot().await;
    }

    /// Shut the session down with a human-readable reason, transmitted in
    /// the CEASE notification (RFC 8203).
    pub async fn shutdown(self, reason: &str) {
        let _ = self.updates.send(Command::Shutdown(reason.to_string())).await;
    }

    async fn send_snapshot(&self) {
        let snapshot = Rib::new(self.parameters.clone(), self.rib.clone());
        let _ = self.updates.send(Command::Update(snapshot)).await;
    }
}

// Mutates the shared status snapshot; only the session task writes,
// Session::status reads.
#[derive(Clone)]
struct StatusHandle(Arc<Mutex<SessionStatus>>);

impl StatusHandle {
    fn state(&self, state: State) {
        let mut s = self.0.lock().expect("status lock");
        s.state = state;
        s.when = Utc::now();
    }

    fn active(&self, hold_time: u16, local_asn: u16, local_ip: &str) {
        let mut s = self.0.lock().expect("status lock");
        s.state = State::Active;
        s.when = Utc::now();
        s.attempts += 1;
        s.adj_rib_out = Vec::new();
        s.prefixes = 0;
        s.advertised = 0;
        s.withdrawn = 0;
        s.hold_time = hold_time;
        s.local_asn = local_asn;
        s.remote_asn = 0;
        s.local_ip = local_ip.to_string();
    }

    fn connect(&self, hold_time: u16, local_ip: &str) {
        let mut s = self.0.lock().expect("status lock");
        s.state = State::Connect;
        s.when = Utc::now();
        s.connections += 1;
        s.hold_time = hold_time;
        s.local_ip = local_ip.to_string();
    }

    fn established(&self, hold_time: u16, local_asn: u16, remote_asn: u16) {
        let mut s = self.0.lock().expect("status lock");
        s.state = State::Established;
        s.when = Utc::now();
        s.established += 1;
        s.last_error = String::new();
        s.hold_time = hold_time;
        s.local_asn = local_asn;
        s.remote_asn = remote_asn;
    }

    fn idle(&self) {
        self.state(State::Idle);
    }

    fn error(&self, error: &str) {
        let mut s = self.0.lock().expect("status lock");
        s.last_error = error.to_string();
    }

    fn update_stats(
        &self,
        took: std::time::Duration,
        rib: &[IpAddr],
        nlri: &BTreeMap<IpAddr, bool>,
    ) {
        let mut s = self.0.lock().expect("status lock");
        s.advertised += nlri.values().filter(|advertise| **advertise).count() as u64;
        s.withdrawn += nlri.values().filter(|advertise| !**advertise).count() as u64;
        s.update_calculation = took.as_millis() as i64;
        s.adj_rib_out = rib.iter().map(|ip| ip.to_string()).collect();
        s.prefixes = rib.len();
    }
}

async fn run(
    router_id: Ipv4Addr,
    peer: String,
    mut updates: mpsc::Receiver<Command>,
    status: StatusHandle,
    logs: Option<Arc<dyn BgpNotify>>,
    initial: Rib,
) {
    let log = |local: bool, reason: &str| {
        if let Some(logs) = &logs {
            logs.bgp_session(&peer, local, reason);
        }
    };

    let mut current = initial;
    let mut retry = Duration::from_millis(0); // first attempt fires immediately

    loop {
        // wait out the retry timer, tracking snapshots sent meanwhile
        let deadline = tokio::time::Instant::now() + retry;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                command = updates.recv() => match command {
                    Some(Command::Update(snapshot)) => current = snapshot,
                    Some(Command::Shutdown(_)) | None => return,
                },
            }
        }

        log(true, "Connecting ...");
        debug!("{} connecting", peer);

        let exit = try_peer(router_id, &peer, &mut updates, &status, &mut current).await;

        let e = exit.describe();
        match &exit {
            Exit::Shutdown(_) => log(true, &e),
            _ => log(false, &e),
        }
        warn!("{}: {}", peer, e);

        status.error(&e);
        status.idle();

        if let Exit::Shutdown(_) = exit {
            return;
        }

        retry = RETRY_TIME;
    }
}

async fn notify(protocol: &mut MessageProtocol, code: u8, sub: u8) -> Exit {
    let notification = Notification::new(code, sub);
    let _ = connection::send(protocol, [Message::Notification(notification.clone())]).await;
    Exit::Sent(notification)
}

async fn try_peer(
    router_id: Ipv4Addr,
    peer: &str,
    updates: &mut mpsc::Receiver<Command>,
    status: &StatusHandle,
    current: &mut Rib,
) -> Exit {
    let p = current.parameters.clone();

    let mut hold_time = p.hold_time;
    if hold_time < 3 {
        hold_time = 10;
    }

    let source = p.source_ip.map(|ip| ip.to_string()).unwrap_or_default();
    status.active(hold_time, p.as_number, &source);

    let mut protocol = match connection::connect(p.source_ip, peer).await {
        Ok(protocol) => protocol,
        Err(e) => return Exit::Local(CONNECTION_FAILED, e.to_string()),
    };

    let local = match protocol.get_ref().local_addr() {
        Ok(addr) => addr.ip(),
        Err(_) => return Exit::Local(INVALID_LOCALIP, "No local address".to_string()),
    };
    let ipv6 = local.is_ipv6();

    status.connect(hold_time, &local.to_string());

    let open = Open::new(p.as_number, hold_time, router_id, p.multiprotocol);
    if let Err(e) = connection::send(&mut protocol, [Message::Open(open)]).await {
        return Exit::Local(REMOTE_SHUTDOWN, e.to_string());
    }

    status.state(State::OpenSent);
    let mut state = State::OpenSent;

    let mut hold_timer = HoldTimer::new(hold_time);
    let mut ticker = interval(Duration::from_millis(100));

    // IPv4 next hop: configured, else the socket's local address, else the
    // router ID when the session runs over IPv6
    let next_hop4 = p
        .next_hop4
        .or(match local {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .unwrap_or(router_id);

    // 16 octets (one address) or 32 (global + link-local pair)
    let next_hop6: Vec<u8> = match (p.next_hop6, p.link_local6) {
        (Some(global), Some(link_local)) => [global.octets(), link_local.octets()].concat(),
        (Some(global), None) => global.octets().to_vec(),
        (None, Some(link_local)) => link_local.octets().to_vec(),
        (None, None) => match local {
            IpAddr::V6(ip) => ip.octets().to_vec(),
            IpAddr::V4(_) => vec![0; 16],
        },
    };

    let template = UpdateBuilder {
        as_number: p.as_number,
        external: false,
        next_hop4,
        next_hop6,
        local_pref: p.local_pref,
        med: p.med,
        communities: p.communities.clone(),
    };

    let mut external = false;
    let mut adj_rib_out: Vec<IpAddr> = Vec::new();
    let mut parameters = p.clone();

    loop {
        tokio::select! {
            message = protocol.next() => {
                let message = match message {
                    None => return Exit::Local(REMOTE_SHUTDOWN, "Connection closed".to_string()),
                    Some(Err(e)) => return Exit::Local(REMOTE_SHUTDOWN, e.to_string()),
                    Some(Ok(message)) => message,
                };

                hold_timer.received();

                match message {
                    Message::Notification(notification) => return Exit::Received(notification),

                    Message::Other { mtype: M_KEEPALIVE, .. } => {
                        if state == State::OpenSent {
                            return notify(&mut protocol, FSM_ERROR, 0).await;
                        }
                        trace!("{} keepalive received", peer);
                    }

                    Message::Open(open) => {
                        if state != State::OpenSent {
                            return notify(&mut protocol, FSM_ERROR, 0).await;
                        }
                        if open.version != 4 {
                            return notify(&mut protocol, OPEN_ERROR, UNSUPPORTED_VERSION_NUMBER).await;
                        }
                        if open.hold_time < 3 {
                            return notify(&mut protocol, OPEN_ERROR, UNACCEPTABLE_HOLD_TIME).await;
                        }
                        if open.identifier == router_id {
                            return notify(&mut protocol, OPEN_ERROR, BAD_BGP_ID).await;
                        }

                        if open.hold_time < hold_time {
                            hold_time = open.hold_time;
                        }
                        hold_timer = HoldTimer::new(hold_time);

                        external = open.as_number != p.as_number;
                        state = State::Established;
                        status.established(hold_time, p.as_number, open.as_number);
                        debug!("{} established (hold time {}s, {})", peer, hold_time,
                            if external { "eBGP" } else { "iBGP" });

                        if let Err(e) = connection::send(&mut protocol, [Message::KeepAlive]).await {
                            return Exit::Local(REMOTE_SHUTDOWN, e.to_string());
                        }
                        hold_timer.sent();

                        // advertise whatever is in the RIB right now
                        let started = Instant::now();
                        let mut builder = template.with_parameters(&current.parameters);
                        builder.external = external;

                        let (list, map) = nlri(&current.adj_rib_out(ipv6), &[], false);
                        adj_rib_out = list;
                        parameters = current.parameters.clone();

                        if !map.is_empty() {
                            let messages = match builder.updates(&map) {
                                None => return notify(&mut protocol, CEASE, OUT_OF_RESOURCES).await,
                                Some(messages) => messages,
                            };
                            if let Err(e) = connection::send(
                                &mut protocol,
                                messages.into_iter().map(Message::Update),
                            ).await {
                                return Exit::Local(REMOTE_SHUTDOWN, e.to_string());
                            }
                            hold_timer.sent();
                        }

                        status.update_stats(started.elapsed(), &adj_rib_out, &map);
                    }

                    Message::Other { mtype: M_UPDATE, .. } => {
                        if state != State::Established {
                            return notify(&mut protocol, FSM_ERROR, 0).await;
                        }
                        // no route processing here: contents are discarded,
                        // the hold timer reset is all that matters
                    }

                    _ => return notify(&mut protocol, MESSAGE_HEADER_ERROR, BAD_MESSAGE_TYPE).await,
                }
            }

            command = updates.recv() => {
                match command {
                    None => {
                        let notification = Notification::new(CEASE, ADMINISTRATIVE_SHUTDOWN);
                        let _ = connection::send(
                            &mut protocol,
                            [Message::Notification(notification.clone())],
                        ).await;
                        return Exit::Shutdown(notification);
                    }

                    Some(Command::Shutdown(reason)) => {
                        let notification =
                            Notification::with_data(CEASE, ADMINISTRATIVE_SHUTDOWN, &reason);
                        let _ = connection::send(
                            &mut protocol,
                            [Message::Notification(notification.clone())],
                        ).await;
                        return Exit::Shutdown(notification);
                    }

                    Some(Command::Update(snapshot)) => {
                        if state == State::Established {
                            let started = Instant::now();
                            let mut builder = template.with_parameters(&snapshot.parameters);
                            builder.external = external;

                            // force re-advertisement when attributes changed
                            let force = parameters.diff(&snapshot.parameters);
                            let (list, map) = nlri(&snapshot.adj_rib_out(ipv6), &adj_rib_out, force);
                            adj_rib_out = list;
                            parameters = snapshot.parameters.clone();

                            if !map.is_empty() {
                                let messages = match builder.updates(&map) {
                                    None => return notify(&mut protocol, CEASE, OUT_OF_RESOURCES).await,
                                    Some(messages) => messages,
                                };
                                if let Err(e) = connection::send(
                                    &mut protocol,
                                    messages.into_iter().map(Message::Update),
                                ).await {
                                    return Exit::Local(REMOTE_SHUTDOWN, e.to_string());
                                }
                                hold_timer.sent();
                            }

                            status.update_stats(started.elapsed(), &adj_rib_out, &map);
                        }
                        *current = snapshot;
                    }
                }
            }

            _ = ticker.tick() => {
                if hold_timer.is_expired() {
                    return notify(&mut protocol, HOLD_TIMER_EXPIRED, 0).await;
                }
                if state == State::Established && hold_timer.keepalive_due() {
                    if let Err(e) = connection::send(&mut protocol, [Message::KeepAlive]).await {
                        return Exit::Local(REMOTE_SHUTDOWN, e.to_string());
                    }
                    hold_timer.sent();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::SinkExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use super::super::codec::MessageCodec;
    use super::super::message::Update;
    use super::*;

    async fn next_message(protocol: &mut MessageProtocol) -> Message {
        match protocol.next().await {
            Some(Ok(message)) => message,
            other => panic!("peer read failed: {:?}", other),
        }
    }

    async fn read_update(protocol: &mut MessageProtocol) -> Update {
        loop {
            match next_message(protocol).await {
                Message::Other { mtype, body } if mtype == M_UPDATE => {
                    return Update::parse(&body).unwrap()
                }
                Message::Other { mtype, .. } if mtype == M_KEEPALIVE => continue,
                other => panic!("expected UPDATE, got {:?}", other),
            }
        }
    }

    async fn read_notification(protocol: &mut MessageProtocol) -> Notification {
        loop {
            match next_message(protocol).await {
                Message::Notification(notification) => return notification,
                Message::Other { mtype, .. } if mtype == M_KEEPALIVE => continue,
                Message::Other { mtype, .. } if mtype == M_UPDATE => continue,
                other => panic!("expected NOTIFICATION, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_establish_update_withdraw_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();

        let a: IpAddr = "192.168.0.1".parse().unwrap();
        let b: IpAddr = "192.168.0.2".parse().unwrap();

        let params = Parameters {
            as_number: 65001,
            hold_time: 90,
            next_hop4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..Default::default()
        };
        let mut session = Session::new(
            Ipv4Addr::new(10, 0, 0, 1),
            &peer,
            params,
            vec![a, b],
            None,
        );

        let (stream, _) = listener.accept().await.unwrap();
        let mut remote = Framed::new(stream, MessageCodec::new());

        let open = match next_message(&mut remote).await {
            Message::Open(open) => open,
            other => panic!("expected OPEN, got {:?}", other),
        };
        assert_eq!(open.version, 4);
        assert_eq!(open.as_number, 65001);
        assert_eq!(open.hold_time, 90);
        assert_eq!(open.identifier, Ipv4Addr::new(10, 0, 0, 1));

        // eBGP peer
        remote
            .send(Message::Open(Open::new(65000, 90, Ipv4Addr::new(10, 0, 0, 2), false)))
            .await
            .unwrap();

        // initial advertisement: both addresses, eBGP attributes
        let update = read_update(&mut remote).await;
        assert_eq!(
            update.announced,
            vec![Ipv4Addr::new(192, 168, 0, 1), Ipv4Addr::new(192, 168, 0, 2)]
        );
        assert_eq!(update.as_path(), Some(&[65001][..]));
        assert_eq!(update.local_pref(), None);
        assert_eq!(update.next_hop(), Some(Ipv4Addr::new(10, 0, 0, 1)));

        // shrink the RIB: expect a pure withdraw of B
        session.rib(vec![a]).await;
        let update = read_update(&mut remote).await;
        assert_eq!(update.withdrawn, vec![Ipv4Addr::new(192, 168, 0, 2)]);
        assert!(update.announced.is_empty());
        assert!(update.attributes.is_empty());

        // same RIB again: idempotent, nothing must arrive before the CEASE
        session.rib(vec![a]).await;

        drop(session);
        let notification = read_notification(&mut remote).await;
        assert_eq!(notification.code, CEASE);
        assert_eq!(notification.sub, ADMINISTRATIVE_SHUTDOWN);
    }

    #[tokio::test]
    async fn test_parameter_change_readvertises() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();

        let a: IpAddr = "192.168.0.1".parse().unwrap();

        let params = Parameters {
            as_number: 65001,
            hold_time: 90,
            next_hop4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..Default::default()
        };
        let mut session = Session::new(
            Ipv4Addr::new(10, 0, 0, 1),
            &peer,
            params.clone(),
            vec![a],
            None,
        );

        let (stream, _) = listener.accept().await.unwrap();
        let mut remote = Framed::new(stream, MessageCodec::new());

        match next_message(&mut remote).await {
            Message::Open(_) => (),
            other => panic!("expected OPEN, got {:?}", other),
        }
        // iBGP this time
        remote
            .send(Message::Open(Open::new(65001, 90, Ipv4Addr::new(10, 0, 0, 2), false)))
            .await
            .unwrap();

        let update = read_update(&mut remote).await;
        assert_eq!(update.local_pref(), Some(100), "iBGP default LOCAL_PREF");
        assert_eq!(update.as_path(), Some(&[][..]));

        // MED change forces a re-advertisement of the whole adj-RIB-out
        let mut changed = params.clone();
        changed.med = 123;
        session.configure(changed).await;

        let update = read_update(&mut remote).await;
        assert_eq!(update.announced, vec![Ipv4Addr::new(192, 168, 0, 1)]);
        assert!(update
            .attributes
            .iter()
            .any(|a| matches!(a, super::super::message::PathAttribute::MultiExitDisc(123))));

        drop(session);
    }

    #[tokio::test]
    async fn test_hold_timer_expiry_returns_to_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();

        let params = Parameters {
            as_number: 65001,
            hold_time: 3,
            ..Default::default()
        };
        let session = Session::new(
            Ipv4Addr::new(10, 0, 0, 1),
            &peer,
            params,
            vec!["192.168.0.1".parse().unwrap()],
            None,
        );

        let (stream, _) = listener.accept().await.unwrap();
        let mut remote = Framed::new(stream, MessageCodec::new());

        match next_message(&mut remote).await {
            Message::Open(_) => (),
            other => panic!("expected OPEN, got {:?}", other),
        }
        remote
            .send(Message::Open(Open::new(65000, 3, Ipv4Addr::new(10, 0, 0, 2), false)))
            .await
            .unwrap();

        // stay silent: after the 3 second hold time the session must
        // notify HOLD_TIMER_EXPIRED and drop the connection
        let notification = read_notification(&mut remote).await;
        assert_eq!(notification.code, HOLD_TIMER_EXPIRED);
        assert_eq!(notification.sub, 0);

        assert!(remote.next().await.map(|r| r.is_err()).unwrap_or(true));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = session.status();
        assert_eq!(status.state, State::Idle);
        assert!(status.last_error.contains("Hold timer expired"));
        assert_eq!(status.established, 1);
    }

    #[tokio::test]
    async fn test_keepalive_before_open_is_fsm_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();

        let _session = Session::new(
            Ipv4Addr::new(10, 0, 0, 1),
            &peer,
            Parameters {
                as_number: 65001,
                hold_time: 90,
                ..Default::default()
            },
            vec![],
            None,
        );

        let (stream, _) = listener.accept().await.unwrap();
        let mut remote = Framed::new(stream, MessageCodec::new());

        match next_message(&mut remote).await {
            Message::Open(_) => (),
            other => panic!("expected OPEN, got {:?}", other),
        }

        // KEEPALIVE while the session is still in OPEN_SENT
        remote.send(Message::KeepAlive).await.unwrap();

        let notification = read_notification(&mut remote).await;
        assert_eq!(notification.code, FSM_ERROR);
    }

    #[tokio::test]
    async fn test_multiprotocol_ipv6_advertisement() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();

        let v6: IpAddr = "2001:db8::1".parse().unwrap();

        let params = Parameters {
            as_number: 65001,
            hold_time: 90,
            multiprotocol: true,
            next_hop4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            next_hop6: Some("fd00::1".parse().unwrap()),
            ..Default::default()
        };
        let _session = Session::new(
            Ipv4Addr::new(10, 0, 0, 1),
            &peer,
            params,
            vec![v6],
            None,
        );

        let (stream, _) = listener.accept().await.unwrap();
        let mut remote = Framed::new(stream, MessageCodec::new());

        let open = match next_message(&mut remote).await {
            Message::Open(open) => open,
            other => panic!("expected OPEN, got {:?}", other),
        };
        assert!(open.multiprotocol, "OPEN advertises the MP capability");

        remote
            .send(Message::Open(Open::new(65000, 90, Ipv4Addr::new(10, 0, 0, 2), true)))
            .await
            .unwrap();

        // the IPv6 prefix travels in MP_REACH_NLRI even over an IPv4 session
        let update = read_update(&mut remote).await;
        assert!(update.announced.is_empty(), "no IPv4 NLRI");
        let mp = update
            .attributes
            .iter()
            .find_map(|a| match a {
                super::super::message::PathAttribute::MpReachNlri { next_hop, announced } => {
                    Some((next_hop.clone(), announced.clone()))
                }
                _ => None,
            })
            .expect("MP_REACH_NLRI present");
        assert_eq!(mp.0, "fd00::1".parse::<std::net::Ipv6Addr>().unwrap().octets().to_vec());
        assert_eq!(mp.1, vec!["2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_connection_failure_sets_last_error() {
        // a listener that is immediately dropped gives a refused port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();
        drop(listener);

        let session = Session::new(
            Ipv4Addr::new(10, 0, 0, 1),
            &peer,
            Parameters {
                as_number: 65001,
                ..Default::default()
            },
            vec![],
            None,
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = session.status();
        assert_eq!(status.state, State::Idle);
        assert!(status.last_error.contains("Connection failed"));
        assert_eq!(status.attempts, 1);
    }
}
