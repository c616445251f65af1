//! A deliberately small BGP-4 speaker which originates host routes (/32 and
//! /128) for load-balanced virtual addresses. It never learns routes: UPDATE
//! messages received from the peer are discarded.
//!
//! RFC 4271 (BGP-4), RFC 4760/2545 (multiprotocol extensions for IPv6),
//! RFC 8203 (administrative shutdown communication).

mod codec;
mod connection;
mod hold_timer;
mod message;
mod pool;
mod rib;
mod session;

pub use message::{Message, Notification, Open, PathAttribute, Update, UpdateBuilder};
pub use pool::Pool;
pub use rib::Rib;
pub use session::{Session, SessionStatus, State};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

pub(crate) const M_OPEN: u8 = 1;
pub(crate) const M_UPDATE: u8 = 2;
pub(crate) const M_NOTIFICATION: u8 = 3;
pub(crate) const M_KEEPALIVE: u8 = 4;

pub(crate) const IGP: u8 = 0;

// Capabilities Optional Parameter (RFC 3392) and the one capability we send,
// Multiprotocol Extensions for BGP-4.
pub(crate) const CAPABILITIES_OPTIONAL_PARAMETER: u8 = 2;
pub(crate) const BGP4_MP: u8 = 1;

// Path attribute type codes
pub(crate) const ORIGIN: u8 = 1;
pub(crate) const AS_PATH: u8 = 2;
pub(crate) const NEXT_HOP: u8 = 3;
pub(crate) const MULTI_EXIT_DISC: u8 = 4;
pub(crate) const LOCAL_PREF: u8 = 5;
pub(crate) const COMMUNITIES: u8 = 8;
pub(crate) const MP_REACH_NLRI: u8 = 14;
pub(crate) const MP_UNREACH_NLRI: u8 = 15;

pub(crate) const AS_SEQUENCE: u8 = 2;

// NOTIFICATION error codes
pub const MESSAGE_HEADER_ERROR: u8 = 1;
pub const OPEN_ERROR: u8 = 2;
pub const HOLD_TIMER_EXPIRED: u8 = 4;
pub const FSM_ERROR: u8 = 5;
pub const CEASE: u8 = 6;

// MESSAGE_HEADER_ERROR subcodes
pub const BAD_MESSAGE_TYPE: u8 = 3;

// OPEN_ERROR subcodes
pub const UNSUPPORTED_VERSION_NUMBER: u8 = 1;
pub const BAD_BGP_ID: u8 = 3;
pub const UNACCEPTABLE_HOLD_TIME: u8 = 6;

// CEASE subcodes (RFC 4486)
pub const ADMINISTRATIVE_SHUTDOWN: u8 = 2;
pub const PEER_DECONFIGURED: u8 = 3;
pub const OUT_OF_RESOURCES: u8 = 8;

// Local (code 0) subcodes. These never go on the wire, they only record why
// a session ended for observability purposes.
pub const CONNECTION_FAILED: u8 = 0;
pub const REMOTE_SHUTDOWN: u8 = 1;
pub const LOCAL_SHUTDOWN: u8 = 2;
pub const INVALID_LOCALIP: u8 = 3;

// Path attribute flag bytes: Optional/Well-known, Non-transitive/Transitive,
// Complete/Partial, Regular/Extended-length packed into the top nibble.
pub(crate) const WTCR: u8 = 64; // Well-known, Transitive, Complete, Regular length
pub(crate) const OTCR: u8 = 192; // Optional, Transitive, Complete, Regular length
pub(crate) const ONCR: u8 = 128; // Optional, Non-transitive, Complete, Regular length
pub(crate) const ONCE: u8 = 144; // Optional, Non-transitive, Complete, Extended length

/// Human-readable rendition of a notification code/subcode pair, including
/// the private code-0 family of local termination reasons.
pub fn note(code: u8, sub: u8) -> String {
    let s: String = match code {
        0 => {
            return match sub {
                CONNECTION_FAILED => "Connection failed",
                REMOTE_SHUTDOWN => "Remote shutdown",
                LOCAL_SHUTDOWN => "Local shutdown",
                INVALID_LOCALIP => "Invalid local IP",
                _ => "Unknown",
            }
            .to_string()
        }
        MESSAGE_HEADER_ERROR => {
            let mut s = "Message header error".to_string();
            if sub == BAD_MESSAGE_TYPE {
                s += "; Bad message type";
            }
            s
        }
        OPEN_ERROR => {
            let mut s = "OPEN error".to_string();
            match sub {
                UNSUPPORTED_VERSION_NUMBER => s += "; Unsupported version number",
                BAD_BGP_ID => s += "; Bad BGP identifier",
                UNACCEPTABLE_HOLD_TIME => s += "; Unacceptable hold time",
                _ => (),
            }
            s
        }
        FSM_ERROR => "Finite state machine error".to_string(),
        HOLD_TIMER_EXPIRED => "Hold timer expired".to_string(),
        CEASE => {
            let mut s = "Cease".to_string();
            match sub {
                ADMINISTRATIVE_SHUTDOWN => s += "; Administrative shutdown",
                PEER_DECONFIGURED => s += "; Peer deconfigured",
                OUT_OF_RESOURCES => s += "; Out of resources",
                _ => (),
            }
            s
        }
        _ => "<unrecognised>".to_string(),
    };
    s
}

/// A standard (4-byte) BGP community, displayed in `asn:value` form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Community(pub u32);

impl Community {
    pub fn new(asn: u16, value: u16) -> Self {
        Community((u32::from(asn) << 16) | u32::from(value))
    }
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 16, self.0 & 0xffff)
    }
}

impl FromStr for Community {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((asn, val)) => Ok(Community::new(asn.parse()?, val.parse()?)),
            None => Ok(Community(value.parse()?)),
        }
    }
}

/// Per-peer configuration for a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Parameters {
    /// Local autonomous system number.
    pub as_number: u16,

    /// Proposed hold time in seconds. Values below 3 are lifted to 10.
    pub hold_time: u16,

    /// Source address to bind the TCP connection to; the network stack
    /// chooses the address and interface when unset.
    pub source_ip: Option<IpAddr>,

    /// Next hop for IPv4 NLRI; the socket's local address when unset.
    pub next_hop4: Option<Ipv4Addr>,

    /// Global IPv6 next hop for MP_REACH_NLRI; the socket's local address
    /// when unset.
    pub next_hop6: Option<Ipv6Addr>,

    /// Link-local IPv6 next hop. When both this and `next_hop6` are set the
    /// MP_REACH_NLRI next-hop field carries the 32-byte global + link-local
    /// pair.
    pub link_local6: Option<Ipv6Addr>,

    /// Advertise the multiprotocol capability and send IPv6 prefixes via
    /// MP_REACH_NLRI/MP_UNREACH_NLRI.
    pub multiprotocol: bool,

    /// LOCAL_PREF for iBGP sessions; 0 means the protocol default of 100.
    /// Never sent on eBGP sessions.
    pub local_pref: u32,

    /// MULTI_EXIT_DISC, only included when non-zero.
    pub med: u32,

    pub communities: Vec<Community>,

    /// Prefixes to advertise. A non-empty accept list passes matching
    /// addresses unconditionally before the reject list is consulted.
    pub accept: Vec<IpNetwork>,

    /// Prefixes to withhold from this peer.
    pub reject: Vec<IpNetwork>,
}

impl Parameters {
    /// True when a change to these parameters forces re-advertisement of
    /// every prefix in the adj-RIB-out.
    pub fn diff(&self, other: &Parameters) -> bool {
        self.local_pref != other.local_pref
            || self.med != other.med
            || self.communities != other.communities
    }
}

/// Observer for peer lifecycle and session state events.
///
/// All methods have no-op defaults, implement whichever are interesting.
pub trait BgpNotify: Send + Sync {
    /// A peer was added to or removed from the pool.
    fn bgp_peer(&self, _peer: &str, _params: &Parameters, _added: bool) {}

    /// A session changed state; `local` is true for locally initiated
    /// events (connecting, local shutdown), `reason` is human readable.
    fn bgp_session(&self, _peer: &str, _local: bool, _reason: &str) {}
}
