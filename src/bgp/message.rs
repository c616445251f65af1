use std::collections::BTreeMap;
use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{note, Community, Parameters};
use crate::utils::{as_u16_be, as_u32_be, transform_u16_to_bytes, transform_u32_to_bytes};

pub const HEADER_LENGTH: usize = 19;
pub const MAX_MESSAGE_LENGTH: usize = 4096;

// Encoded UPDATE bodies above this size are split in half and re-encoded.
const FRAGMENT_THRESHOLD: usize = 4000;

// Index-capped like the original; beyond this the attribute would need
// extended length encoding.
const MAX_COMMUNITIES: usize = 60;

/// A BGP message as seen by the session. Inbound traffic only ever produces
/// `Open`, `Notification` or `Other` (the reader does not interpret UPDATE
/// or KEEPALIVE bodies); the remaining variants exist for transmission.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Open(Open),
    Update(Update),
    Notification(Notification),
    KeepAlive,
    Other { mtype: u8, body: Vec<u8> },
}

impl Message {
    pub(crate) fn mtype(&self) -> u8 {
        match self {
            Message::Open(_) => super::M_OPEN,
            Message::Update(_) => super::M_UPDATE,
            Message::Notification(_) => super::M_NOTIFICATION,
            Message::KeepAlive => super::M_KEEPALIVE,
            Message::Other { mtype, .. } => *mtype,
        }
    }

    pub(crate) fn body(&self) -> Vec<u8> {
        match self {
            Message::Open(open) => open.encode(),
            Message::Update(update) => update.encode(),
            Message::Notification(notification) => notification.encode(),
            Message::KeepAlive => Vec::new(),
            Message::Other { body, .. } => body.clone(),
        }
    }
}

/// OPEN message body. The only optional parameter handled is Capabilities,
/// and the only capability the multiprotocol extension for IPv4/IPv6
/// unicast; anything else the peer sends is accepted but unexamined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Open {
    pub version: u8,
    pub as_number: u16,
    pub hold_time: u16,
    pub identifier: Ipv4Addr,
    pub multiprotocol: bool,
}

impl Open {
    pub fn new(as_number: u16, hold_time: u16, identifier: Ipv4Addr, multiprotocol: bool) -> Self {
        Open {
            version: 4,
            as_number,
            hold_time,
            identifier,
            multiprotocol,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(29);
        body.push(self.version);
        body.extend_from_slice(&transform_u16_to_bytes(self.as_number));
        body.extend_from_slice(&transform_u16_to_bytes(self.hold_time));
        body.extend_from_slice(&self.identifier.octets());

        let mut params = Vec::new();
        if self.multiprotocol {
            // Capability code, length, AFI (2 octets), reserved, SAFI
            for mp in [
                [super::BGP4_MP, 4, 0, 1, 0, 1], // IPv4 unicast
                [super::BGP4_MP, 4, 0, 2, 0, 1], // IPv6 unicast
            ] {
                params.push(super::CAPABILITIES_OPTIONAL_PARAMETER);
                params.push(mp.len() as u8);
                params.extend_from_slice(&mp);
            }
        }

        body.push(params.len() as u8);
        body.extend_from_slice(&params);
        body
    }

    pub fn parse(body: &[u8]) -> Result<Open> {
        if body.len() < 10 {
            return Err(Error::new(ErrorKind::InvalidData, "OPEN body too short"));
        }

        let version = body[0];
        let as_number = as_u16_be([body[1], body[2]]);
        let hold_time = as_u16_be([body[3], body[4]]);
        let identifier = Ipv4Addr::new(body[5], body[6], body[7], body[8]);

        let opt_len = body[9] as usize;
        if body.len() < 10 + opt_len {
            return Err(Error::new(ErrorKind::InvalidData, "OPEN truncated"));
        }

        let mut multiprotocol = false;
        let mut params = &body[10..10 + opt_len];
        while params.len() >= 2 {
            let ptype = params[0];
            let plen = params[1] as usize;
            if params.len() < 2 + plen {
                return Err(Error::new(ErrorKind::InvalidData, "OPEN parameter truncated"));
            }
            if ptype == super::CAPABILITIES_OPTIONAL_PARAMETER {
                let mut caps = &params[2..2 + plen];
                while caps.len() >= 2 {
                    let clen = caps[1] as usize;
                    if caps.len() < 2 + clen {
                        break;
                    }
                    if caps[0] == super::BGP4_MP {
                        multiprotocol = true;
                    }
                    caps = &caps[2 + clen..];
                }
            }
            params = &params[2 + plen..];
        }

        Ok(Open {
            version,
            as_number,
            hold_time,
            identifier,
            multiprotocol,
        })
    }
}

/// NOTIFICATION message body. Code 0 is a private family used to record
/// local termination reasons, it is never transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub code: u8,
    pub sub: u8,
    pub data: Vec<u8>,
}

impl Notification {
    pub fn new(code: u8, sub: u8) -> Self {
        Notification {
            code,
            sub,
            data: Vec::new(),
        }
    }

    pub fn with_data(code: u8, sub: u8, data: &str) -> Self {
        // RFC 8203 limits the shutdown communication to 128 octets
        let mut data = data.as_bytes().to_vec();
        data.truncate(128);
        Notification { code, sub, data }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + self.data.len());
        body.push(self.code);
        body.push(self.sub);
        body.extend_from_slice(&self.data);
        body
    }

    pub fn parse(body: &[u8]) -> Result<Notification> {
        if body.len() < 2 {
            return Err(Error::new(ErrorKind::InvalidData, "NOTIFICATION body too short"));
        }
        Ok(Notification {
            code: body[0],
            sub: body[1],
            data: body[2..].to_vec(),
        })
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.code, self.sub, note(self.code, self.sub))?;
        if !self.data.is_empty() {
            write!(f, " ({})", String::from_utf8_lossy(&self.data))?;
        }
        Ok(())
    }
}

/// A path attribute as this speaker emits them. AS_PATH carries at most one
/// AS_SEQUENCE segment (empty on iBGP); MP next hops are 16 or 32 raw bytes
/// (global, or global followed by link-local).
#[derive(Debug, Clone, PartialEq)]
pub enum PathAttribute {
    Origin(u8),
    AsPath(Vec<u16>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    Communities(Vec<Community>),
    MpReachNlri {
        next_hop: Vec<u8>,
        announced: Vec<Ipv6Addr>,
    },
    MpUnreachNlri(Vec<Ipv6Addr>),
}

impl PathAttribute {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            PathAttribute::Origin(origin) => {
                out.extend_from_slice(&[super::WTCR, super::ORIGIN, 1, *origin]);
            }
            PathAttribute::AsPath(sequence) => {
                if sequence.is_empty() {
                    out.extend_from_slice(&[super::WTCR, super::AS_PATH, 0]);
                } else {
                    let len = 2 + 2 * sequence.len();
                    out.extend_from_slice(&[super::WTCR, super::AS_PATH, len as u8]);
                    out.push(super::AS_SEQUENCE);
                    out.push(sequence.len() as u8);
                    for asn in sequence {
                        out.extend_from_slice(&transform_u16_to_bytes(*asn));
                    }
                }
            }
            PathAttribute::NextHop(hop) => {
                out.extend_from_slice(&[super::WTCR, super::NEXT_HOP, 4]);
                out.extend_from_slice(&hop.octets());
            }
            PathAttribute::MultiExitDisc(med) => {
                out.extend_from_slice(&[super::ONCR, super::MULTI_EXIT_DISC, 4]);
                out.extend_from_slice(&transform_u32_to_bytes(*med));
            }
            PathAttribute::LocalPref(pref) => {
                out.extend_from_slice(&[super::WTCR, super::LOCAL_PREF, 4]);
                out.extend_from_slice(&transform_u32_to_bytes(*pref));
            }
            PathAttribute::Communities(communities) => {
                let communities: Vec<_> = communities.iter().take(MAX_COMMUNITIES).collect();
                out.extend_from_slice(&[
                    super::OTCR,
                    super::COMMUNITIES,
                    (4 * communities.len()) as u8,
                ]);
                for community in communities {
                    out.extend_from_slice(&transform_u32_to_bytes(community.0));
                }
            }
            PathAttribute::MpReachNlri { next_hop, announced } => {
                // RFC 2545: AFI 2, SAFI 1, next hop length/bytes, zero SNPAs
                let mut attr = vec![0, 2, 1];
                attr.push(next_hop.len() as u8);
                attr.extend_from_slice(next_hop);
                attr.push(0);
                for ip in announced {
                    attr.push(128);
                    attr.extend_from_slice(&ip.octets());
                }
                extend_optional(out, super::MP_REACH_NLRI, &attr);
            }
            PathAttribute::MpUnreachNlri(withdrawn) => {
                let mut attr = vec![0, 2, 1];
                for ip in withdrawn {
                    attr.push(128);
                    attr.extend_from_slice(&ip.octets());
                }
                extend_optional(out, super::MP_UNREACH_NLRI, &attr);
            }
        }
    }
}

// Optional non-transitive attribute, extended length iff the body exceeds
// one length octet.
fn extend_optional(out: &mut Vec<u8>, attr_type: u8, body: &[u8]) {
    if body.len() > 255 {
        out.push(super::ONCE);
        out.push(attr_type);
        out.extend_from_slice(&transform_u16_to_bytes(body.len() as u16));
    } else {
        out.push(super::ONCR);
        out.push(attr_type);
        out.push(body.len() as u8);
    }
    out.extend_from_slice(body);
}

/// UPDATE message body: withdrawn /32 routes, path attributes (which carry
/// any IPv6 reachability), and announced /32 routes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub withdrawn: Vec<Ipv4Addr>,
    pub attributes: Vec<PathAttribute>,
    pub announced: Vec<Ipv4Addr>,
}

impl Update {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();

        body.extend_from_slice(&transform_u16_to_bytes((5 * self.withdrawn.len()) as u16));
        for ip in &self.withdrawn {
            body.push(32);
            body.extend_from_slice(&ip.octets());
        }

        let mut attrs = Vec::new();
        for attribute in &self.attributes {
            attribute.encode(&mut attrs);
        }
        body.extend_from_slice(&transform_u16_to_bytes(attrs.len() as u16));
        body.extend_from_slice(&attrs);

        for ip in &self.announced {
            body.push(32);
            body.extend_from_slice(&ip.octets());
        }

        body
    }

    /// Decode an UPDATE this speaker could have produced; host routes only.
    pub fn parse(body: &[u8]) -> Result<Update> {
        let invalid = |reason: &str| Error::new(ErrorKind::InvalidData, reason.to_string());

        if body.len() < 4 {
            return Err(invalid("UPDATE body too short"));
        }

        let withdrawn_len = as_u16_be([body[0], body[1]]) as usize;
        if body.len() < 2 + withdrawn_len + 2 {
            return Err(invalid("UPDATE withdrawn routes truncated"));
        }
        let withdrawn = parse_nlri4(&body[2..2 + withdrawn_len])?;

        let mut at = 2 + withdrawn_len;
        let attrs_len = as_u16_be([body[at], body[at + 1]]) as usize;
        at += 2;
        if body.len() < at + attrs_len {
            return Err(invalid("UPDATE path attributes truncated"));
        }

        let mut attributes = Vec::new();
        let mut attrs = &body[at..at + attrs_len];
        while !attrs.is_empty() {
            if attrs.len() < 3 {
                return Err(invalid("path attribute header truncated"));
            }
            let flags = attrs[0];
            let attr_type = attrs[1];
            let (len, skip) = if flags & 0x10 != 0 {
                if attrs.len() < 4 {
                    return Err(invalid("extended path attribute truncated"));
                }
                (as_u16_be([attrs[2], attrs[3]]) as usize, 4)
            } else {
                (attrs[2] as usize, 3)
            };
            if attrs.len() < skip + len {
                return Err(invalid("path attribute body truncated"));
            }
            let value = &attrs[skip..skip + len];
            attributes.push(parse_attribute(attr_type, value)?);
            attrs = &attrs[skip + len..];
        }

        let announced = parse_nlri4(&body[at + attrs_len..])?;

        Ok(Update {
            withdrawn,
            attributes,
            announced,
        })
    }

    pub fn local_pref(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            PathAttribute::LocalPref(pref) => Some(*pref),
            _ => None,
        })
    }

    pub fn as_path(&self) -> Option<&[u16]> {
        self.attributes.iter().find_map(|a| match a {
            PathAttribute::AsPath(path) => Some(path.as_slice()),
            _ => None,
        })
    }

    pub fn next_hop(&self) -> Option<Ipv4Addr> {
        self.attributes.iter().find_map(|a| match a {
            PathAttribute::NextHop(hop) => Some(*hop),
            _ => None,
        })
    }
}

fn parse_attribute(attr_type: u8, value: &[u8]) -> Result<PathAttribute> {
    let invalid = |reason: &str| Error::new(ErrorKind::InvalidData, reason.to_string());

    match attr_type {
        super::ORIGIN => {
            if value.len() != 1 {
                return Err(invalid("bad ORIGIN length"));
            }
            Ok(PathAttribute::Origin(value[0]))
        }
        super::AS_PATH => {
            if value.is_empty() {
                return Ok(PathAttribute::AsPath(Vec::new()));
            }
            if value.len() < 2 || value[0] != super::AS_SEQUENCE {
                return Err(invalid("unsupported AS_PATH segment"));
            }
            let count = value[1] as usize;
            if value.len() != 2 + 2 * count {
                return Err(invalid("bad AS_PATH length"));
            }
            let sequence = value[2..]
                .chunks_exact(2)
                .map(|c| as_u16_be([c[0], c[1]]))
                .collect();
            Ok(PathAttribute::AsPath(sequence))
        }
        super::NEXT_HOP => {
            if value.len() != 4 {
                return Err(invalid("bad NEXT_HOP length"));
            }
            Ok(PathAttribute::NextHop(Ipv4Addr::new(
                value[0], value[1], value[2], value[3],
            )))
        }
        super::MULTI_EXIT_DISC => {
            if value.len() != 4 {
                return Err(invalid("bad MULTI_EXIT_DISC length"));
            }
            Ok(PathAttribute::MultiExitDisc(as_u32_be([
                value[0], value[1], value[2], value[3],
            ])))
        }
        super::LOCAL_PREF => {
            if value.len() != 4 {
                return Err(invalid("bad LOCAL_PREF length"));
            }
            Ok(PathAttribute::LocalPref(as_u32_be([
                value[0], value[1], value[2], value[3],
            ])))
        }
        super::COMMUNITIES => {
            if value.len() % 4 != 0 {
                return Err(invalid("bad COMMUNITIES length"));
            }
            let communities = value
                .chunks_exact(4)
                .map(|c| Community(as_u32_be([c[0], c[1], c[2], c[3]])))
                .collect();
            Ok(PathAttribute::Communities(communities))
        }
        super::MP_REACH_NLRI => {
            if value.len() < 5 || value[0] != 0 || value[1] != 2 || value[2] != 1 {
                return Err(invalid("unsupported MP_REACH_NLRI family"));
            }
            let nh_len = value[3] as usize;
            if !(nh_len == 16 || nh_len == 32) || value.len() < 4 + nh_len + 1 {
                return Err(invalid("bad MP_REACH_NLRI next hop"));
            }
            let next_hop = value[4..4 + nh_len].to_vec();
            if value[4 + nh_len] != 0 {
                return Err(invalid("unexpected SNPAs in MP_REACH_NLRI"));
            }
            let announced = parse_nlri6(&value[4 + nh_len + 1..])?;
            Ok(PathAttribute::MpReachNlri { next_hop, announced })
        }
        super::MP_UNREACH_NLRI => {
            if value.len() < 3 || value[0] != 0 || value[1] != 2 || value[2] != 1 {
                return Err(invalid("unsupported MP_UNREACH_NLRI family"));
            }
            Ok(PathAttribute::MpUnreachNlri(parse_nlri6(&value[3..])?))
        }
        _ => Err(invalid("unsupported path attribute")),
    }
}

fn parse_nlri4(mut data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        if data[0] != 32 || data.len() < 5 {
            return Err(Error::new(ErrorKind::InvalidData, "expected /32 NLRI"));
        }
        out.push(Ipv4Addr::new(data[1], data[2], data[3], data[4]));
        data = &data[5..];
    }
    Ok(out)
}

fn parse_nlri6(mut data: &[u8]) -> Result<Vec<Ipv6Addr>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        if data[0] != 128 || data.len() < 17 {
            return Err(Error::new(ErrorKind::InvalidData, "expected /128 NLRI"));
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[1..17]);
        out.push(Ipv6Addr::from(octets));
        data = &data[17..];
    }
    Ok(out)
}

/// Everything needed to render an NLRI map into UPDATE messages for one
/// peer. Captured once per connection (next hops depend on the socket's
/// local address) and refreshed with `with_parameters` when the peer is
/// reconfigured.
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    pub as_number: u16,
    pub external: bool,
    pub next_hop4: Ipv4Addr,
    pub next_hop6: Vec<u8>,
    pub local_pref: u32,
    pub med: u32,
    pub communities: Vec<Community>,
}

impl UpdateBuilder {
    pub fn with_parameters(&self, p: &Parameters) -> UpdateBuilder {
        let mut builder = self.clone();
        builder.local_pref = p.local_pref;
        builder.med = p.med;
        builder.communities = p.communities.clone();
        builder
    }

    /// Render a single UPDATE. `true` entries are advertised, `false`
    /// entries withdrawn; the map order (sorted by address) fixes the wire
    /// order.
    pub fn update(&self, nlri: &BTreeMap<IpAddr, bool>) -> Update {
        let mut withdrawn = Vec::new();
        let mut announced = Vec::new();
        let mut withdrawn6 = Vec::new();
        let mut announced6 = Vec::new();

        for (ip, advertise) in nlri {
            match ip {
                IpAddr::V4(ip) => {
                    if *advertise {
                        announced.push(*ip);
                    } else {
                        withdrawn.push(*ip);
                    }
                }
                IpAddr::V6(ip) => {
                    if *advertise {
                        announced6.push(*ip);
                    } else {
                        withdrawn6.push(*ip);
                    }
                }
            }
        }

        let mut attributes = Vec::new();

        // A pure-withdraw UPDATE carries no path attributes at all
        if !announced.is_empty() || !announced6.is_empty() || !withdrawn6.is_empty() {
            attributes.push(PathAttribute::Origin(super::IGP));

            if self.external {
                attributes.push(PathAttribute::AsPath(vec![self.as_number]));
            } else {
                attributes.push(PathAttribute::AsPath(Vec::new()));
            }

            attributes.push(PathAttribute::NextHop(self.next_hop4));

            // RFC 4271: MUST be included on iBGP, MUST NOT be sent to
            // external peers
            if !self.external {
                let local_pref = if self.local_pref == 0 { 100 } else { self.local_pref };
                attributes.push(PathAttribute::LocalPref(local_pref));
            }

            if !self.communities.is_empty() {
                attributes.push(PathAttribute::Communities(self.communities.clone()));
            }

            if self.med > 0 {
                attributes.push(PathAttribute::MultiExitDisc(self.med));
            }

            if !announced6.is_empty() {
                attributes.push(PathAttribute::MpReachNlri {
                    next_hop: self.next_hop6.clone(),
                    announced: announced6,
                });
            }

            if !withdrawn6.is_empty() {
                attributes.push(PathAttribute::MpUnreachNlri(withdrawn6));
            }
        }

        Update {
            withdrawn,
            attributes,
            announced,
        }
    }

    /// Render the NLRI map into one or more UPDATEs, splitting the map in
    /// half recursively whenever an encoded body exceeds the fragmentation
    /// bound. `None` means a single prefix could not be made to fit, which
    /// the session reports as CEASE/OUT_OF_RESOURCES.
    pub fn updates(&self, nlri: &BTreeMap<IpAddr, bool>) -> Option<Vec<Update>> {
        if nlri.is_empty() {
            return Some(Vec::new());
        }

        let update = self.update(nlri);

        if update.encode().len() < FRAGMENT_THRESHOLD {
            return Some(vec![update]);
        }

        if nlri.len() == 1 {
            return None;
        }

        let half = nlri.len() / 2;
        let first: BTreeMap<IpAddr, bool> = nlri.iter().take(half).map(|(k, v)| (*k, *v)).collect();
        let second: BTreeMap<IpAddr, bool> = nlri.iter().skip(half).map(|(k, v)| (*k, *v)).collect();

        let mut out = self.updates(&first)?;
        out.extend(self.updates(&second)?);
        Some(out)
    }
}
