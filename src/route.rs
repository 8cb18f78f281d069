//! Prefix route rules for TUN-mode next-hop resolution.
//!
//! Matching is first-rule-wins in insertion order, not longest-prefix: the
//! switch hands rules down already ordered, and reordering them here would
//! change observable routing.

use std::net::Ipv4Addr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One destination network with its next-hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRule {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub nexthop: Ipv4Addr,
}

impl PrefixRule {
    pub fn new(network: Ipv4Addr, prefix_len: u8, nexthop: Ipv4Addr) -> Result<Self> {
        if prefix_len > 32 {
            return Err(Error::config(format!("bad prefix length {prefix_len}")));
        }
        Ok(Self {
            network,
            prefix_len,
            nexthop,
        })
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    /// True when `addr` falls inside this rule's network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(addr) & mask == u32::from(self.network) & mask
    }
}

/// Ordered rule list consulted per packet on TUN devices.
#[derive(Default)]
pub struct RouteTable {
    rules: RwLock<Vec<PrefixRule>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rules, keeping their given order.
    pub fn add_rules(&self, rules: &[PrefixRule]) {
        self.rules.write().unwrap().extend_from_slice(rules);
    }

    /// Remove exactly-matching rules.
    pub fn del_rules(&self, rules: &[PrefixRule]) {
        self.rules
            .write()
            .unwrap()
            .retain(|rule| !rules.contains(rule));
    }

    /// Replace the whole rule set.
    pub fn replace(&self, rules: Vec<PrefixRule>) {
        *self.rules.write().unwrap() = rules;
    }

    /// Next-hop for `dst`: the FIRST rule containing it wins, in insertion
    /// order. Without a match the destination is its own next-hop.
    pub fn find_next(&self, dst: Ipv4Addr) -> Ipv4Addr {
        self.rules
            .read()
            .unwrap()
            .iter()
            .find(|rule| rule.contains(dst))
            .map(|rule| rule.nexthop)
            .unwrap_or(dst)
    }

    /// Number of installed rules.
    pub fn len(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(net: [u8; 4], len: u8, hop: [u8; 4]) -> PrefixRule {
        PrefixRule::new(Ipv4Addr::from(net), len, Ipv4Addr::from(hop)).unwrap()
    }

    #[test]
    fn test_contains() {
        let r = rule([10, 1, 0, 0], 16, [10, 1, 0, 1]);
        assert!(r.contains(Ipv4Addr::new(10, 1, 200, 3)));
        assert!(!r.contains(Ipv4Addr::new(10, 2, 0, 3)));

        let all = rule([0, 0, 0, 0], 0, [192, 168, 0, 1]);
        assert!(all.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_bad_prefix_rejected() {
        assert!(PrefixRule::new(Ipv4Addr::UNSPECIFIED, 33, Ipv4Addr::UNSPECIFIED).is_err());
    }

    #[test]
    fn test_first_match_wins_over_more_specific() {
        let table = RouteTable::new();
        table.add_rules(&[
            rule([10, 0, 0, 0], 8, [172, 16, 0, 1]),
            rule([10, 1, 0, 0], 16, [172, 16, 0, 2]),
        ]);

        // The /8 was inserted first, so it wins even though the /16 is more
        // specific.
        assert_eq!(
            table.find_next(Ipv4Addr::new(10, 1, 5, 5)),
            Ipv4Addr::new(172, 16, 0, 1)
        );
    }

    #[test]
    fn test_no_match_returns_destination() {
        let table = RouteTable::new();
        table.add_rules(&[rule([10, 0, 0, 0], 8, [172, 16, 0, 1])]);

        let dst = Ipv4Addr::new(192, 168, 1, 1);
        assert_eq!(table.find_next(dst), dst);
    }

    #[test]
    fn test_del_rules() {
        let table = RouteTable::new();
        let a = rule([10, 0, 0, 0], 8, [172, 16, 0, 1]);
        let b = rule([10, 1, 0, 0], 16, [172, 16, 0, 2]);
        table.add_rules(&[a, b]);
        table.del_rules(&[a]);

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.find_next(Ipv4Addr::new(10, 1, 5, 5)),
            Ipv4Addr::new(172, 16, 0, 2)
        );
    }
}
