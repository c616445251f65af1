//! Health monitoring: one probe loop per `(service, destination)` instance,
//! with a five-sample hysteresis window debouncing state transitions.

mod dns;
mod http;
mod syn;

pub use syn::SynProber;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use http::ClientCache;

const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// The service part of an instance key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Service {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: u8,
}

/// The backend part of an instance key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Destination {
    pub address: IpAddr,
    pub port: u16,
}

/// The unit of monitoring: one destination under one service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Instance {
    pub service: Service,
    pub destination: Destination,
}

/// What to monitor for an instance, and whether it starts out healthy.
#[derive(Clone, Debug, Default)]
pub struct Target {
    pub init: bool,
    pub checks: Checks,
}

pub type Checks = Vec<Check>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Https,
    Syn,
    Dns,
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CheckType::Http => "http",
            CheckType::Https => "https",
            CheckType::Syn => "syn",
            CheckType::Dns => "dns",
        };
        write!(f, "{}", s)
    }
}

/// Check method flag. The meaning depends on the check type: GET/HEAD for
/// http and https, UDP/TCP for dns, ignored for syn. On the wire it is a
/// bare bool or one of the method names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Method(pub bool);

impl Method {
    pub const GET: Method = Method(false);
    pub const HEAD: Method = Method(true);
    pub const UDP: Method = Method(false);
    pub const TCP: Method = Method(true);
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(self.0)
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
        struct MethodVisitor;

        impl<'de> Visitor<'de> for MethodVisitor {
            type Value = Method;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a bool or one of GET, HEAD, TCP, UDP")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Method, E> {
                Ok(Method(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Method, E> {
                match v {
                    "GET" | "UDP" | "udp" => Ok(Method(false)),
                    "HEAD" | "TCP" | "tcp" => Ok(Method(true)),
                    _ => Err(E::custom(format!("Badly formed method: {}", v))),
                }
            }
        }

        deserializer.deserialize_any(MethodVisitor)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Type of check; http, https, syn, dns
    #[serde(rename = "type")]
    pub kind: CheckType,

    /// TCP/UDP port to probe; 0 means the destination's port
    #[serde(default, skip_serializing_if = "port_is_zero")]
    pub port: u16,

    /// HTTP Host header to send in healthcheck
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    /// Path of resource to use when building a URI for HTTP/HTTPS checks
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// HTTP status codes which pass the check; empty means {200}, and 0
    /// matches anything
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect: Vec<u16>,

    #[serde(default)]
    pub method: Method,
}

fn port_is_zero(port: &u16) -> bool {
    *port == 0
}

impl Check {
    pub fn http(port: u16, path: &str) -> Check {
        Check {
            kind: CheckType::Http,
            port,
            host: String::new(),
            path: path.to_string(),
            expect: Vec::new(),
            method: Method::GET,
        }
    }

    pub fn https(port: u16, path: &str) -> Check {
        Check {
            kind: CheckType::Https,
            ..Check::http(port, path)
        }
    }

    pub fn syn(port: u16) -> Check {
        Check {
            kind: CheckType::Syn,
            ..Check::http(port, "")
        }
    }

    pub fn dns(port: u16) -> Check {
        Check {
            kind: CheckType::Dns,
            ..Check::http(port, "")
        }
    }

    fn codes(&self) -> String {
        self.expect
            .iter()
            .map(|code| code.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let method = match self.kind {
            CheckType::Http | CheckType::Https => {
                if self.method.0 {
                    "HEAD"
                } else {
                    "GET"
                }
            }
            CheckType::Dns => {
                if self.method.0 {
                    "tcp"
                } else {
                    "udp"
                }
            }
            CheckType::Syn => "tcp",
        };
        write!(
            f,
            "{{{} {} {} {} [{}] {}}}",
            self.kind, self.port, self.host, self.path, self.codes(), method
        )
    }
}

/// Most recent probe outcome for an instance.
#[derive(Clone, Debug, Serialize)]
pub struct Status {
    pub ok: bool,
    pub diagnostic: String,
    pub took: Duration,
    pub last: DateTime<Utc>,
    pub when: DateTime<Utc>,
    pub initialised: bool,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            ok: false,
            diagnostic: String::new(),
            took: Duration::from_secs(0),
            last: Utc::now(),
            when: Utc::now(),
            initialised: false,
        }
    }
}

/// Receives state transitions and probe results; all methods default to
/// no-ops.
pub trait Notifier: Send + Sync {
    /// An instance changed state (or announced its initial state).
    fn notify(&self, _instance: &Instance, _up: bool) {}

    /// A probe round completed.
    fn result(&self, _instance: &Instance, _ok: bool, _diagnostic: &str) {}

    /// A single check ran.
    fn check(&self, _instance: &Instance, _check: &str, _round: u64, _ok: bool, _diagnostic: &str) {
    }
}

/// Overrides the built-in probes entirely, mostly useful for testing.
pub trait Prober: Send + Sync {
    fn probe(&self, instance: &Instance, check: &Check) -> (bool, String);
}

struct InstanceState {
    checks: mpsc::UnboundedSender<Checks>,
    status: Arc<Mutex<Status>>,
}

/// Drives the per-instance probe loops. `update` reconciles the monitored
/// set against a new target map without losing the history of instances
/// that persist; the receiver returned by `new` fires (coalesced) whenever
/// any instance changes state.
pub struct Monitor {
    services: Mutex<HashMap<Instance, InstanceState>>,
    changed: mpsc::Sender<bool>,
    notifier: Option<Arc<dyn Notifier>>,
    prober: Option<Arc<dyn Prober>>,
    syn: Option<Arc<dyn SynProber>>,
    clients: Arc<ClientCache>,
}

impl Monitor {
    pub fn new(
        syn: Option<Arc<dyn SynProber>>,
        notifier: Option<Arc<dyn Notifier>>,
        prober: Option<Arc<dyn Prober>>,
    ) -> (Arc<Monitor>, mpsc::Receiver<bool>) {
        let (changed, rx) = mpsc::channel(1);
        let clients = ClientCache::new();
        http::spawn_sweeper(&clients);

        let monitor = Arc::new(Monitor {
            services: Mutex::new(HashMap::new()),
            changed,
            notifier,
            prober,
            syn,
            clients,
        });

        (monitor, rx)
    }

    /// Reconcile the monitored instances: existing instances receive their
    /// (possibly changed) check lists live, instances absent from the map
    /// have their probe loops terminated, and new instances are started
    /// with their initial state.
    pub fn update(self: &Arc<Self>, targets: HashMap<Instance, Target>) {
        let mut targets = targets;
        {
            let mut services = self.services.lock().expect("services lock");

            services.retain(|instance, state| match targets.remove(instance) {
                Some(target) => state.checks.send(target.checks).is_ok(),
                None => false, // sender drops, probe loop terminates
            });

            for (instance, target) in targets.drain() {
                debug!("Monitoring {:?} (init {})", instance, target.init);
                let status = Arc::new(Mutex::new(Status {
                    ok: target.init,
                    diagnostic: "Initialising ...".to_string(),
                    when: Utc::now(),
                    ..Default::default()
                }));
                let checks = self.spawn_probe_loop(instance, status.clone(), target);
                services.insert(instance, InstanceState { checks, status });
            }
        }

        self.inform();
    }

    pub fn stop(self: &Arc<Self>) {
        self.update(HashMap::new());
    }

    pub fn status(&self, service: &Service, destination: &Destination) -> Option<Status> {
        let instance = Instance {
            service: *service,
            destination: *destination,
        };
        let services = self.services.lock().expect("services lock");
        services
            .get(&instance)
            .map(|state| state.status.lock().expect("status lock").clone())
    }

    /// Snapshot of every monitored instance.
    pub fn dump(&self) -> HashMap<Instance, Status> {
        let services = self.services.lock().expect("services lock");
        services
            .iter()
            .map(|(instance, state)| (*instance, state.status.lock().expect("status lock").clone()))
            .collect()
    }

    fn inform(&self) {
        let _ = self.changed.try_send(true);
    }

    fn notify(&self, instance: &Instance, up: bool) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(instance, up);
        }
    }

    fn result(&self, instance: &Instance, ok: bool, diagnostic: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.result(instance, ok, diagnostic);
        }
    }

    fn check_event(&self, instance: &Instance, check: &str, round: u64, ok: bool, diagnostic: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.check(instance, check, round, ok, diagnostic);
        }
    }

    fn spawn_probe_loop(
        self: &Arc<Self>,
        instance: Instance,
        status: Arc<Mutex<Status>>,
        target: Target,
    ) -> mpsc::UnboundedSender<Checks> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Checks>();

        self.notify(&instance, target.init);

        let monitor = Arc::clone(self);
        let mut checks = target.checks;

        tokio::spawn(async move {
            let mut history = [target.init; 5];

            let mut ticker = interval(PROBE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately

            let mut round: u64 = 0;

            loop {
                round += 1;

                tokio::select! {
                    new = rx.recv() => match new {
                        // live reconfiguration, history is preserved
                        Some(new) => { checks = new; continue }
                        None => return,
                    },
                    _ = ticker.tick() => {}
                }

                let was = status.lock().expect("status lock").clone();
                let mut now = was.clone();

                let t = Utc::now();
                let started = Instant::now();

                let (ok, diagnostic) = monitor.probes(&instance, &checks, round).await;
                now.diagnostic = diagnostic.clone();

                monitor.result(&instance, ok, &diagnostic);

                history.rotate_left(1);
                history[4] = ok;

                now.ok = assess(was.ok, &history);
                now.last = t;
                now.took = started.elapsed();
                now.initialised = true;

                let mut changed = false;
                if !was.initialised || was.ok != now.ok {
                    if was.initialised {
                        monitor.notify(&instance, now.ok);
                    }
                    changed = true;
                    now.when = t;
                }

                *status.lock().expect("status lock") = now;

                if changed {
                    monitor.inform();
                }
            }
        });

        tx
    }

    async fn probes(&self, instance: &Instance, checks: &Checks, round: u64) -> (bool, String) {
        for check in checks {
            let mut check = check.clone();
            if check.port == 0 {
                check.port = instance.destination.port;
            }

            let (ok, diagnostic) = match &self.prober {
                Some(prober) => prober.probe(instance, &check),
                None => self.probe(instance.destination.address, &check).await,
            };

            self.check_event(instance, &check.to_string(), round, ok, &diagnostic);

            if !ok {
                return (false, format!("{}: {}", check.kind, diagnostic));
            }
        }

        (true, "OK".to_string())
    }

    /// Run one check against an address with the built-in probes.
    pub async fn probe(&self, addr: IpAddr, check: &Check) -> (bool, String) {
        match check.kind {
            CheckType::Http => {
                http::probe(
                    &self.clients,
                    addr,
                    check.port,
                    false,
                    check.method.0,
                    &check.host,
                    &check.path,
                    &check.expect,
                )
                .await
            }
            CheckType::Https => {
                http::probe(
                    &self.clients,
                    addr,
                    check.port,
                    true,
                    check.method.0,
                    &check.host,
                    &check.path,
                    &check.expect,
                )
                .await
            }
            CheckType::Syn => self.syn_probe(addr, check.port),
            CheckType::Dns => dns::probe(addr, check.port, check.method.0).await,
        }
    }

    fn syn_probe(&self, addr: IpAddr, port: u16) -> (bool, String) {
        let addr = match addr {
            IpAddr::V4(addr) => addr,
            IpAddr::V6(_) => return (false, "Not an IPv4 address".to_string()),
        };

        match &self.syn {
            None => (false, "No SYN server".to_string()),
            Some(syn) => syn.check(addr, port),
        }
    }
}

// The hysteresis rule over the five-sample window: from up, fewer than
// four passes goes down; from down, anything short of five straight
// passes stays down.
fn assess(was_ok: bool, history: &[bool; 5]) -> bool {
    let passed = history.iter().filter(|ok| **ok).count();
    if was_ok {
        passed >= 4
    } else {
        passed > 4
    }
}
