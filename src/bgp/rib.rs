use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use super::Parameters;

/// Snapshot of the addresses to advertise and the parameters in force,
/// handed to a session whenever either changes.
#[derive(Clone, Debug, Default)]
pub struct Rib {
    pub addrs: Vec<IpAddr>,
    pub parameters: Parameters,
}

impl Rib {
    pub fn new(parameters: Parameters, addrs: Vec<IpAddr>) -> Self {
        Rib { addrs, parameters }
    }

    /// The prefixes this peer should see: family- and policy-filtered,
    /// sorted by address so wire output is deterministic.
    pub fn adj_rib_out(&self, ipv6_session: bool) -> Vec<IpAddr> {
        self.parameters.filter(ipv6_session, &self.addrs)
    }
}

impl Parameters {
    /// Without the multiprotocol capability only prefixes matching the
    /// transport family pass. A non-empty accept list passes matching
    /// addresses before the reject list is consulted; anything not caught
    /// by either list passes.
    pub fn filter(&self, ipv6_session: bool, dest: &[IpAddr]) -> Vec<IpAddr> {
        let mut pass: Vec<IpAddr> = Vec::with_capacity(dest.len());

        'filter: for &ip in dest {
            if !self.multiprotocol {
                if ip.is_ipv6() && !ipv6_session {
                    continue;
                }
                if ip.is_ipv4() && ipv6_session {
                    continue;
                }
            }

            for accept in &self.accept {
                if accept.contains(ip) {
                    pass.push(ip);
                    continue 'filter;
                }
            }

            for reject in &self.reject {
                if reject.contains(ip) {
                    continue 'filter;
                }
            }

            pass.push(ip);
        }

        pass.sort();
        pass.dedup();
        pass
    }
}

/// Diff the filtered RIB against the previously transmitted adj-RIB-out.
///
/// Returns the new adj-RIB-out and the NLRI map: `false` for prefixes that
/// vanished (withdraw), `true` for new prefixes, or for every current
/// prefix when `force` is set (a LOCAL_PREF/MED/COMMUNITIES change requires
/// re-advertisement).
pub fn nlri(curr: &[IpAddr], prev: &[IpAddr], force: bool) -> (Vec<IpAddr>, BTreeMap<IpAddr, bool>) {
    let new: BTreeSet<IpAddr> = curr.iter().copied().collect();
    let old: BTreeSet<IpAddr> = prev.iter().copied().collect();

    let mut nlri = BTreeMap::new();

    for ip in old.difference(&new) {
        nlri.insert(*ip, false);
    }

    let mut list = Vec::with_capacity(new.len());
    for ip in &new {
        list.push(*ip);
        if force || !old.contains(ip) {
            nlri.insert(*ip, true);
        }
    }

    (list, nlri)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(ips: &[&str]) -> Vec<IpAddr> {
        ips.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    #[test]
    fn test_family_filter() {
        let p = Parameters::default();
        let rib = addrs(&["192.168.0.1", "2001:db8::1"]);

        assert_eq!(p.filter(false, &rib), addrs(&["192.168.0.1"]));
        assert_eq!(p.filter(true, &rib), addrs(&["2001:db8::1"]));

        let mp = Parameters {
            multiprotocol: true,
            ..Default::default()
        };
        assert_eq!(mp.filter(false, &rib).len(), 2);
        assert_eq!(mp.filter(true, &rib).len(), 2);
    }

    #[test]
    fn test_accept_beats_reject() {
        let p = Parameters {
            accept: vec!["192.168.0.0/24".parse().unwrap()],
            reject: vec!["192.168.0.0/16".parse().unwrap()],
            ..Default::default()
        };
        let rib = addrs(&["192.168.0.1", "192.168.1.1", "10.0.0.1"]);

        // .0.1 passes via accept, .1.1 dies on reject, 10.0.0.1 matches
        // neither list and falls through
        assert_eq!(p.filter(false, &rib), addrs(&["10.0.0.1", "192.168.0.1"]));
    }

    #[test]
    fn test_reject_only() {
        let p = Parameters {
            reject: vec!["10.0.0.0/8".parse().unwrap()],
            ..Default::default()
        };
        let rib = addrs(&["10.1.2.3", "192.168.0.1"]);
        assert_eq!(p.filter(false, &rib), addrs(&["192.168.0.1"]));
    }

    #[test]
    fn test_nlri_initial() {
        let curr = addrs(&["192.168.0.1", "192.168.0.2"]);
        let (list, map) = nlri(&curr, &[], false);
        assert_eq!(list, curr);
        assert_eq!(map.len(), 2);
        assert!(map.values().all(|advertise| *advertise));
    }

    #[test]
    fn test_nlri_idempotent() {
        // unchanged RIB and parameters yield an empty map: nothing is sent
        let curr = addrs(&["192.168.0.1", "192.168.0.2"]);
        let (_, map) = nlri(&curr, &curr, false);
        assert!(map.is_empty());
    }

    #[test]
    fn test_nlri_withdraw_on_shrink() {
        let prev = addrs(&["192.168.0.1", "192.168.0.2"]);
        let curr = addrs(&["192.168.0.1"]);
        let (list, map) = nlri(&curr, &prev, false);
        assert_eq!(list, curr);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"192.168.0.2".parse().unwrap()), Some(&false));
    }

    #[test]
    fn test_nlri_force_readvertises_everything() {
        let prev = addrs(&["192.168.0.1", "192.168.0.2"]);
        let curr = addrs(&["192.168.0.1", "192.168.0.3"]);
        let (_, map) = nlri(&curr, &prev, true);

        assert_eq!(map.get(&"192.168.0.1".parse().unwrap()), Some(&true));
        assert_eq!(map.get(&"192.168.0.3".parse().unwrap()), Some(&true));
        assert_eq!(map.get(&"192.168.0.2".parse().unwrap()), Some(&false));
    }

    #[test]
    fn test_nlri_advertise_withdraw_disjoint() {
        let prev = addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let curr = addrs(&["10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        let (_, map) = nlri(&curr, &prev, false);

        // a prefix appears at most once, as advertise or withdraw
        assert_eq!(map.get(&"10.0.0.1".parse().unwrap()), Some(&false));
        assert_eq!(map.get(&"10.0.0.4".parse().unwrap()), Some(&true));
        assert_eq!(map.len(), 2);
    }
}
