//! Compiled matchers for each rule kind.

use crate::cidr::IpCidr;
use crate::target::{Direction, FiveTuple, PortSpec, Target};
use regex::{Regex, RegexBuilder};
use std::net::IpAddr;

/// Upper bound on compiled URL-pattern size.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Domain pattern: exact name, `*.suffix`, or `*` for any host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    Any,
    Exact(String),
    /// Stored without the leading `*.`.
    Suffix(String),
}

impl DomainPattern {
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let p = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if p.is_empty() {
            return Err("empty domain pattern".into());
        }
        if p == "*" {
            return Ok(DomainPattern::Any);
        }
        if let Some(suffix) = p.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(format!("invalid wildcard domain '{pattern}'"));
            }
            return Ok(DomainPattern::Suffix(suffix.to_string()));
        }
        if p.contains('*') {
            return Err(format!("wildcard only allowed as leading label: '{pattern}'"));
        }
        Ok(DomainPattern::Exact(p))
    }

    /// `host` must already be lowercased.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            DomainPattern::Any => true,
            DomainPattern::Exact(name) => host == name,
            DomainPattern::Suffix(suffix) => {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
        }
    }
}

/// Address side of a protocol rule: exact address or block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMatch(IpCidr);

impl AddressMatch {
    pub fn parse(s: &str) -> Result<Self, String> {
        s.parse::<IpCidr>().map(AddressMatch)
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        self.0.contains(ip)
    }
}

/// Protocol-tuple matcher. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct TupleMatcher {
    pub protocol: Option<String>,
    pub src_ip: Option<AddressMatch>,
    pub dst_ip: Option<AddressMatch>,
    pub src_port: Option<PortSpec>,
    pub dst_port: Option<PortSpec>,
    pub direction: Option<Direction>,
}

impl TupleMatcher {
    pub fn matches(&self, t: &FiveTuple) -> bool {
        self.protocol.as_ref().map_or(true, |p| *p == t.protocol)
            && self.src_ip.as_ref().map_or(true, |m| m.matches(t.src_ip))
            && self.dst_ip.as_ref().map_or(true, |m| m.matches(t.dst_ip))
            && self.src_port.as_ref().map_or(true, |p| p.contains(t.src_port))
            && self.dst_port.as_ref().map_or(true, |p| p.contains(t.dst_port))
            && self.direction.map_or(true, |d| d.admits(t.direction))
    }
}

/// A compiled rule pattern.
#[derive(Debug, Clone)]
pub enum Matcher {
    Domain(DomainPattern),
    Ip(IpAddr),
    Cidr(IpCidr),
    Url(Regex),
    Tuple(TupleMatcher),
}

impl Matcher {
    pub fn domain(pattern: &str) -> Result<Self, String> {
        DomainPattern::parse(pattern).map(Matcher::Domain)
    }

    pub fn ip(pattern: &str) -> Result<Self, String> {
        let (host, _) = crate::target::split_host_port(pattern)?;
        host.parse::<IpAddr>()
            .map(|ip| Matcher::Ip(ip.to_canonical()))
            .map_err(|e| format!("invalid address '{pattern}': {e}"))
    }

    pub fn cidr(pattern: &str) -> Result<Self, String> {
        if !pattern.contains('/') {
            return Err(format!("missing prefix length in '{pattern}'"));
        }
        pattern.parse::<IpCidr>().map(Matcher::Cidr)
    }

    pub fn url(pattern: &str) -> Result<Self, String> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map(Matcher::Url)
            .map_err(|e| format!("invalid url pattern '{pattern}': {e}"))
    }

    pub fn matches(&self, target: &Target) -> bool {
        match (self, target) {
            (Matcher::Domain(d), Target::Address { host, .. }) => d.matches(host),
            (Matcher::Ip(ip), Target::Address { ip: Some(t), .. }) => ip == t,
            (Matcher::Cidr(c), Target::Address { ip: Some(t), .. }) => c.contains(*t),
            (Matcher::Url(re), Target::Address { raw, .. }) => re.is_match(raw),
            (Matcher::Tuple(m), Target::Tuple(t)) => m.matches(t),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(s: &str) -> Target {
        Target::parse(s).unwrap()
    }

    #[test]
    fn wildcard_is_case_insensitive() {
        let m = Matcher::domain("*.Example.com").unwrap();
        assert!(m.matches(&target("sub.EXAMPLE.com")));
        assert!(m.matches(&target("example.com")));
        assert!(m.matches(&target("a.b.example.com:443")));
    }

    #[test]
    fn wildcard_is_not_substring() {
        let m = Matcher::domain("*.suffix.com").unwrap();
        assert!(!m.matches(&target("evilsuffix.com")));
        assert!(!m.matches(&target("suffix.com.evil.net")));
    }

    #[test]
    fn exact_domain() {
        let m = Matcher::domain("api.example.com").unwrap();
        assert!(m.matches(&target("API.example.com:443")));
        assert!(!m.matches(&target("x.api.example.com")));
    }

    #[test]
    fn bad_domain_patterns() {
        assert!(Matcher::domain("").is_err());
        assert!(Matcher::domain("foo.*.com").is_err());
        assert!(Matcher::domain("*.*.com").is_err());
    }

    #[test]
    fn ip_canonical_form() {
        let m = Matcher::ip("::1").unwrap();
        assert!(m.matches(&target("[0:0:0:0:0:0:0:1]:22")));
        assert!(!m.matches(&target("[::2]:22")));
        assert!(!m.matches(&target("localhost")));
    }

    #[test]
    fn cidr_requires_prefix() {
        assert!(Matcher::cidr("10.0.0.1").is_err());
        let m = Matcher::cidr("10.0.0.0/8").unwrap();
        assert!(m.matches(&target("10.1.2.3")));
        assert!(!m.matches(&target("11.0.0.0")));
        assert!(!m.matches(&target("ten.example.com")));
    }

    #[test]
    fn url_regex_case_insensitive_on_full_target() {
        let m = Matcher::url(r"^https?://[^/]+/admin").unwrap();
        assert!(m.matches(&target("http://internal.example.com/ADMIN/users")));
        assert!(!m.matches(&target("http://internal.example.com/public")));
        assert!(Matcher::url("(unclosed").is_err());
    }

    #[test]
    fn tuple_unset_fields_match_anything() {
        let m = Matcher::Tuple(TupleMatcher {
            protocol: Some("tcp".into()),
            dst_port: Some("22,80-90".parse().unwrap()),
            direction: Some(Direction::Both),
            ..Default::default()
        });
        assert!(m.matches(&target("tcp:10.0.0.2:40000->10.0.0.9:22:inbound")));
        assert!(m.matches(&target("tcp:10.0.0.2:40000->10.0.0.9:85:outbound")));
        assert!(!m.matches(&target("udp:10.0.0.2:40000->10.0.0.9:22:inbound")));
        assert!(!m.matches(&target("tcp:10.0.0.2:40000->10.0.0.9:443:inbound")));
        // Tuple rules never match address targets.
        assert!(!m.matches(&target("10.0.0.9:22")));
    }

    #[test]
    fn tuple_address_and_direction() {
        let m = Matcher::Tuple(TupleMatcher {
            dst_ip: Some(AddressMatch::parse("192.168.0.0/16").unwrap()),
            src_ip: Some(AddressMatch::parse("10.0.0.2").unwrap()),
            direction: Some(Direction::Outbound),
            ..Default::default()
        });
        assert!(m.matches(&target("udp:10.0.0.2:1->192.168.4.4:53:outbound")));
        assert!(!m.matches(&target("udp:10.0.0.2:1->192.168.4.4:53:inbound")));
        assert!(!m.matches(&target("udp:10.0.0.3:1->192.168.4.4:53:outbound")));
    }
}
