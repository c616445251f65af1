//! Ties the monitor to a data-plane balancer: expands service
//! configuration into monitored instances, recomputes per-service
//! availability when probe state changes, and exposes the healthy-VIP set
//! for route advertisement.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::warn;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::mon::{self, Checks, Instance, Monitor, Notifier, Prober, SynProber, Target};

/// IP protocol numbers for the two supported service protocols.
pub const TCP: u8 = 0x06;
pub const UDP: u8 = 0x11;

/// Opaque scheduler hint, passed through to the balancer.
pub type Scheduler = u8;

type Tuple = mon::Service;

fn protocol_name(protocol: &u8) -> &'static str {
    match *protocol {
        TCP => "TCP",
        UDP => "UDP",
        _ => "Unknown",
    }
}

fn serialize_protocol<S: serde::Serializer>(protocol: &u8, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(protocol_name(protocol))
}

/// A configured layer-4 virtual service and its derived health state.
#[derive(Clone, Debug, Serialize)]
pub struct Service {
    pub address: IpAddr,
    pub port: u16,
    #[serde(serialize_with = "serialize_protocol")]
    pub protocol: u8,
    pub scheduler: Scheduler,
    pub sticky: bool,

    /// Minimum number of healthy destinations for the service to be up.
    pub required: u8,

    pub destinations: Vec<Destination>,

    #[serde(rename = "available")]
    available: u8,

    /// Derived: `available >= required`.
    pub up: bool,

    /// Instant of the last `up` transition.
    pub when: DateTime<Utc>,
}

impl Service {
    pub fn new(address: IpAddr, port: u16, protocol: u8) -> Service {
        Service {
            address,
            port,
            protocol,
            scheduler: 0,
            sticky: false,
            required: 1,
            destinations: Vec::new(),
            available: 0,
            up: false,
            when: Utc::now(),
        }
    }

    /// Number of destinations currently healthy.
    pub fn available(&self) -> u8 {
        self.available
    }

    pub fn healthy(&self) -> bool {
        self.available >= self.required
    }

    fn tuple(&self) -> Tuple {
        Tuple {
            address: self.address,
            port: self.port,
            protocol: self.protocol,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Destination {
    pub address: IpAddr,
    pub port: u16,
    pub disabled: bool,
    pub weight: u8,
    pub status: mon::Status,
    pub checks: Checks,
}

impl Destination {
    pub fn new(address: IpAddr, port: u16) -> Destination {
        Destination {
            address,
            port,
            disabled: false,
            weight: 1,
            status: mon::Status::default(),
            checks: Vec::new(),
        }
    }

    /// 1 if this destination can take traffic, else 0.
    pub fn healthy_weight(&self) -> u8 {
        if !self.disabled && self.status.ok && self.weight > 0 {
            1
        } else {
            0
        }
    }

    fn key(&self) -> mon::Destination {
        mon::Destination {
            address: self.address,
            port: self.port,
        }
    }
}

/// The data plane this director drives. Configuration errors are logged
/// and otherwise ignored; they do not roll back the director's state.
pub trait Balancer: Send + Sync {
    fn configure(&self, services: &[Service]) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

struct NilBalancer;

impl Balancer for NilBalancer {
    fn configure(&self, _services: &[Service]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Service port cannot be 0")]
    ServicePortZero,
    #[error("Only TCP and UDP protocols supported")]
    UnsupportedProtocol,
    #[error("Destination port cannot be 0")]
    DestinationPortZero,
    #[error("Duplicate service {0}")]
    DuplicateService(String),
}

#[derive(Clone, Copy)]
struct UpState {
    up: bool,
    time: DateTime<Utc>,
}

#[derive(Default)]
struct DirectorState {
    cfg: HashMap<Tuple, Service>,
    svc: HashMap<Tuple, UpState>,
}

struct Inner {
    balancer: Arc<dyn Balancer>,
    monitor: Arc<Monitor>,
    state: Mutex<DirectorState>,
    changed: mpsc::Sender<bool>,
}

/// Collaborators handed to the director at construction; all optional.
#[derive(Default)]
pub struct Options {
    pub balancer: Option<Arc<dyn Balancer>>,
    pub syn: Option<Arc<dyn SynProber>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub prober: Option<Arc<dyn Prober>>,
}

/// Owns the monitor and a background task which reacts to probe state
/// changes by reconfiguring the balancer and signalling `c`.
pub struct Director {
    /// Fires (coalesced) whenever service state changes; treat any receive
    /// as "re-read `status`".
    pub c: mpsc::Receiver<bool>,
    inner: Arc<Inner>,
    die: Option<oneshot::Sender<()>>,
}

impl Director {
    /// Start monitoring `config`. On configuration errors nothing is
    /// monitored and no background task runs.
    pub async fn start(config: Vec<Service>, options: Options) -> Result<Director, ConfigError> {
        let (monitor, monitor_rx) = Monitor::new(options.syn, options.notifier, options.prober);
        let (changed, c) = mpsc::channel(1);

        let inner = Arc::new(Inner {
            balancer: options.balancer.unwrap_or_else(|| Arc::new(NilBalancer)),
            monitor,
            state: Mutex::new(DirectorState::default()),
            changed,
        });

        if let Err(e) = inner.configure(config).await {
            inner.monitor.stop();
            return Err(e);
        }

        let (die, die_rx) = oneshot::channel();
        tokio::spawn(background(inner.clone(), monitor_rx, die_rx));

        Ok(Director {
            c,
            inner,
            die: Some(die),
        })
    }

    /// Replace the service configuration. The prior configuration stays in
    /// force when validation fails.
    pub async fn configure(&self, config: Vec<Service>) -> Result<(), ConfigError> {
        self.inner.configure(config).await
    }

    /// Current per-service state, sorted by (address, port, protocol).
    pub async fn status(&self) -> Vec<Service> {
        let mut state = self.inner.state.lock().await;
        self.inner.status(&mut state)
    }

    /// Force a balancer reconfiguration and change signal.
    pub async fn trigger(&self) {
        let mut state = self.inner.state.lock().await;
        self.inner.update(&mut state);
    }

    /// Tear down all monitoring. The background task deconfigures the
    /// balancer and signals `c` one last time.
    pub fn stop(&mut self) {
        self.die.take();
    }
}

async fn background(
    inner: Arc<Inner>,
    mut monitor_rx: mpsc::Receiver<bool>,
    mut die: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut die => {
                let _ = inner.configure(Vec::new()).await;
                inner.monitor.stop();
                inner.inform();
                return;
            }
            changed = monitor_rx.recv() => match changed {
                Some(_) => {
                    let mut state = inner.state.lock().await;
                    inner.update(&mut state);
                }
                None => return,
            },
        }
    }
}

impl Inner {
    async fn configure(&self, config: Vec<Service>) -> Result<(), ConfigError> {
        let mut state = self.state.lock().await;

        for s in &config {
            if s.port == 0 {
                return Err(ConfigError::ServicePortZero);
            }
            if s.protocol != TCP && s.protocol != UDP {
                return Err(ConfigError::UnsupportedProtocol);
            }
            for d in &s.destinations {
                if d.port == 0 {
                    return Err(ConfigError::DestinationPortZero);
                }
            }
        }

        let mut cfg: HashMap<Tuple, Service> = HashMap::with_capacity(config.len());
        for s in config {
            let t = s.tuple();
            if cfg.insert(t, s).is_some() {
                return Err(ConfigError::DuplicateService(format!(
                    "{}:{}:{}",
                    protocol_name(&t.protocol),
                    t.address,
                    t.port
                )));
            }
        }

        // what existed before, for the initial-up policy
        let vips: HashSet<IpAddr> = state.cfg.keys().map(|t| t.address).collect();
        let svcs: HashSet<Tuple> = state.cfg.keys().copied().collect();

        let mut targets: HashMap<Instance, Target> = HashMap::new();
        for (t, s) in &cfg {
            // 1) a brand-new vip starts all checks down, so the address is
            //    not advertised before its backends prove out
            // 2) a new service on an existing vip starts up, so the vip is
            //    not withdrawn
            // 3) a new destination on an existing service starts down, to
            //    avoid rehashing traffic onto an unproven backend
            let init = vips.contains(&s.address) && !svcs.contains(t);

            for d in &s.destinations {
                let instance = Instance {
                    service: *t,
                    destination: d.key(),
                };
                targets.insert(
                    instance,
                    Target {
                        init,
                        checks: d.checks.clone(),
                    },
                );
            }
        }

        state.cfg = cfg;

        self.monitor.update(targets);
        self.update(&mut state);

        Ok(())
    }

    // recompute statuses, push them at the balancer, signal the channel
    fn update(&self, state: &mut DirectorState) {
        let services = self.status(state);
        if let Err(e) = self.balancer.configure(&services) {
            warn!("Balancer configuration failed: {}", e);
        }
        self.inform();
    }

    fn status(&self, state: &mut DirectorState) -> Vec<Service> {
        let mut svc: HashMap<Tuple, UpState> = HashMap::with_capacity(state.cfg.len());
        let mut services: Vec<Service> = Vec::with_capacity(state.cfg.len());

        for (t, s) in &state.cfg {
            let mut s = s.clone();
            let mut available: u8 = 0;

            for d in &mut s.destinations {
                if let Some(status) = self.monitor.status(t, &d.key()) {
                    d.status = status;
                }
                available += d.healthy_weight();
            }

            s.available = available;
            let up = s.healthy();

            let entry = match state.svc.get(t) {
                Some(prev) if prev.up == up => *prev,
                _ => UpState {
                    up,
                    time: Utc::now(),
                },
            };
            svc.insert(*t, entry);

            s.up = entry.up;
            s.when = entry.time;
            services.push(s);
        }

        state.svc = svc;

        services.sort_by_key(|s| (s.address, s.port, s.protocol));
        services
    }

    fn inform(&self) {
        let _ = self.changed.try_send(true);
    }
}

/// Every distinct VIP in the configuration, sorted.
pub fn all_vips(services: &[Service]) -> Vec<IpAddr> {
    services.iter().map(|s| s.address).unique().sorted().collect()
}

/// VIPs for which every service is up. One down service on an address
/// removes the whole address; this is the set fed into the BGP pool's
/// RIB.
pub fn healthy_vips(services: &[Service]) -> Vec<IpAddr> {
    let mut vips: HashMap<IpAddr, bool> = HashMap::new();

    for s in services {
        let healthy = vips.entry(s.address).or_insert(true);
        *healthy &= s.up;
    }

    vips.into_iter()
        .filter_map(|(vip, healthy)| healthy.then_some(vip))
        .sorted()
        .collect()
}
