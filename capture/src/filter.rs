//! Capture filter
//!
//! A small subset of the classic capture filter language, covering what
//! the supervisor hands its workers: `ether src <mac>`, `ether dst <mac>`
//! and `ether host <mac>`, combined with `or`. An empty filter matches
//! everything. The original filter text is also recorded verbatim in the
//! packet metadata rows.

use anyhow::{bail, Result};

use crate::decode::{MacAddr, PacketSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Src(MacAddr),
    Dst(MacAddr),
    Host(MacAddr),
}

impl Term {
    fn matches(&self, packet: &PacketSummary) -> bool {
        match self {
            Term::Src(mac) => packet.src_mac == *mac,
            Term::Dst(mac) => packet.dst_mac == *mac,
            Term::Host(mac) => packet.src_mac == *mac || packet.dst_mac == *mac,
        }
    }
}

/// Parsed filter expression (a disjunction of ether terms).
#[derive(Debug, Clone, Default)]
pub struct FrameFilter {
    expression: String,
    terms: Vec<Term>,
}

impl FrameFilter {
    /// Parse an expression like
    /// `ether dst aa:bb:cc:dd:ee:ff or ether src aa:bb:cc:dd:ee:ff`.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim().trim_matches('"').to_string();
        let mut terms = Vec::new();

        if expression.is_empty() {
            return Ok(Self { expression, terms });
        }

        for clause in expression.split(" or ") {
            let tokens: Vec<&str> = clause.split_whitespace().collect();
            let [keyword, direction, mac] = tokens.as_slice() else {
                bail!("unsupported filter clause: {:?}", clause);
            };
            if *keyword != "ether" {
                bail!("unsupported filter keyword: {:?}", keyword);
            }
            let mac = MacAddr::parse(mac)
                .ok_or_else(|| anyhow::anyhow!("bad MAC in filter clause: {:?}", clause))?;
            let term = match *direction {
                "src" => Term::Src(mac),
                "dst" => Term::Dst(mac),
                "host" => Term::Host(mac),
                other => bail!("unsupported filter direction: {:?}", other),
            };
            terms.push(term);
        }

        Ok(Self { expression, terms })
    }

    /// The original expression, recorded with each metadata row.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, packet: &PacketSummary) -> bool {
        self.terms.is_empty() || self.terms.iter().any(|t| t.matches(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(src: &str, dst: &str) -> PacketSummary {
        PacketSummary {
            src_mac: MacAddr::parse(src).unwrap(),
            dst_mac: MacAddr::parse(dst).unwrap(),
            ethertype: 0x0800,
            vlan_id: None,
            layers: vec!["eth"],
            src_ip: None,
            dst_ip: None,
            src_ip6: None,
            dst_ip6: None,
            src_port: None,
            dst_port: None,
            dhcp: None,
            dns: None,
        }
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = FrameFilter::parse("").unwrap();
        assert!(filter.matches(&packet("00:11:22:33:44:55", "ff:ff:ff:ff:ff:ff")));
        assert_eq!(filter.expression(), "");
    }

    #[test]
    fn test_src_dst_host_terms() {
        let src = FrameFilter::parse("ether src 00:11:22:33:44:55").unwrap();
        assert!(src.matches(&packet("00:11:22:33:44:55", "aa:aa:aa:aa:aa:aa")));
        assert!(!src.matches(&packet("aa:aa:aa:aa:aa:aa", "00:11:22:33:44:55")));

        let dst = FrameFilter::parse("ether dst 00:11:22:33:44:55").unwrap();
        assert!(dst.matches(&packet("aa:aa:aa:aa:aa:aa", "00:11:22:33:44:55")));
        assert!(!dst.matches(&packet("00:11:22:33:44:55", "aa:aa:aa:aa:aa:aa")));

        let host = FrameFilter::parse("ether host 00:11:22:33:44:55").unwrap();
        assert!(host.matches(&packet("00:11:22:33:44:55", "aa:aa:aa:aa:aa:aa")));
        assert!(host.matches(&packet("aa:aa:aa:aa:aa:aa", "00:11:22:33:44:55")));
        assert!(!host.matches(&packet("aa:aa:aa:aa:aa:aa", "bb:bb:bb:bb:bb:bb")));
    }

    #[test]
    fn test_or_combination() {
        let filter = FrameFilter::parse(
            "ether dst 00:11:22:33:44:55 or ether src 00:11:22:33:44:55",
        )
        .unwrap();
        assert!(filter.matches(&packet("00:11:22:33:44:55", "aa:aa:aa:aa:aa:aa")));
        assert!(filter.matches(&packet("aa:aa:aa:aa:aa:aa", "00:11:22:33:44:55")));
        assert!(!filter.matches(&packet("aa:aa:aa:aa:aa:aa", "bb:bb:bb:bb:bb:bb")));
    }

    #[test]
    fn test_quoted_expression() {
        let filter = FrameFilter::parse("\"ether host 00:11:22:33:44:55\"").unwrap();
        assert!(filter.matches(&packet("00:11:22:33:44:55", "aa:aa:aa:aa:aa:aa")));
    }

    #[test]
    fn test_rejects_unsupported_syntax() {
        assert!(FrameFilter::parse("tcp port 80").is_err());
        assert!(FrameFilter::parse("ether src notamac").is_err());
        assert!(FrameFilter::parse("ether between a b").is_err());
    }
}
