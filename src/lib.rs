//! A load-balancer control plane: a health-check director which drives a
//! user-supplied data plane, and a small BGP-4 speaker which advertises
//! the healthy virtual addresses (/32 and /128 host routes) to routing
//! peers.
//!
//! The usual wiring: a [`Director`] monitors backends and computes service
//! state, [`healthy_vips`] reduces that to the set of addresses worth
//! advertising, and a [`bgp::Pool`] keeps one session per peer fed with
//! that set.

pub mod bgp;
pub mod director;
pub mod mon;
pub mod utils;

pub use director::{
    all_vips, healthy_vips, Balancer, ConfigError, Destination, Director, Options, Scheduler,
    Service, TCP, UDP,
};
