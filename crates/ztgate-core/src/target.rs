//! Parsing of policy targets.
//!
//! A target is either an address-style string (`host`, `host:port`,
//! `[v6]:port`, or a URL) or a structured five-tuple of the form
//! `protocol:src_ip:src_port->dst_ip:dst_port:direction`.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Flow direction relative to the tunnel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
    Both,
}

impl Direction {
    /// Rule-side matching: `Both` on the rule accepts either direction.
    pub fn admits(self, actual: Direction) -> bool {
        self == Direction::Both || self == actual
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" | "in" => Ok(Direction::Inbound),
            "outbound" | "out" => Ok(Direction::Outbound),
            "both" | "any" | "*" => Ok(Direction::Both),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Both => "both",
        })
    }
}

/// A port matcher: `443`, `80,443`, `1000-2000`, or a list mixing both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    ranges: Vec<(u16, u16)>,
}

impl PortSpec {
    pub fn contains(&self, port: u16) -> bool {
        self.ranges.iter().any(|&(lo, hi)| port >= lo && port <= hi)
    }
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for item in s.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let range = match item.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_port(lo)?;
                    let hi = parse_port(hi)?;
                    if lo > hi {
                        return Err(format!("inverted port range '{item}'"));
                    }
                    (lo, hi)
                }
                None => {
                    let p = parse_port(item)?;
                    (p, p)
                }
            };
            ranges.push(range);
        }
        if ranges.is_empty() {
            return Err(format!("empty port spec '{s}'"));
        }
        Ok(Self { ranges })
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.trim()
        .parse::<u16>()
        .map_err(|e| format!("invalid port '{s}': {e}"))
}

/// A parsed `protocol:src_ip:src_port->dst_ip:dst_port:direction` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiveTuple {
    pub protocol: String,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub direction: Direction,
}

impl FromStr for FiveTuple {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (left, right) = s
            .split_once("->")
            .ok_or_else(|| format!("missing '->' in tuple '{s}'"))?;

        let (protocol, src) = left
            .split_once(':')
            .ok_or_else(|| format!("missing protocol in tuple '{s}'"))?;
        let (src_ip, src_port) = split_ip_port(src)?;

        let (dst, direction) = right
            .rsplit_once(':')
            .ok_or_else(|| format!("missing direction in tuple '{s}'"))?;
        let (dst_ip, dst_port) = split_ip_port(dst)?;

        let protocol = protocol.trim().to_ascii_lowercase();
        if protocol.is_empty() {
            return Err(format!("empty protocol in tuple '{s}'"));
        }

        Ok(Self {
            protocol,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            direction: direction.parse()?,
        })
    }
}

fn split_ip_port(s: &str) -> Result<(IpAddr, u16), String> {
    let (host, port) = split_host_port(s)?;
    let port = port.ok_or_else(|| format!("missing port in '{s}'"))?;
    let ip = host
        .parse::<IpAddr>()
        .map_err(|e| format!("invalid address '{host}': {e}"))?;
    Ok((ip.to_canonical(), port))
}

/// Split `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 literal.
pub fn split_host_port(s: &str) -> Result<(String, Option<u16>), String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty host".into());
    }

    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated '[' in '{s}'"))?;
        let port = match tail {
            "" => None,
            t => Some(parse_port(
                t.strip_prefix(':')
                    .ok_or_else(|| format!("unexpected '{t}' after ']'"))?,
            )?),
        };
        return Ok((host.to_string(), port));
    }

    if s.parse::<IpAddr>().is_ok() {
        return Ok((s.to_string(), None));
    }

    match s.matches(':').count() {
        0 => Ok((s.to_string(), None)),
        1 => {
            let (host, port) = s.split_once(':').unwrap_or((s, ""));
            if host.is_empty() {
                return Err(format!("empty host in '{s}'"));
            }
            Ok((host.to_string(), Some(parse_port(port)?)))
        }
        _ => Err(format!("ambiguous host '{s}'")),
    }
}

/// A target after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Address or URL target. `host` is lowercased without a trailing dot.
    Address {
        raw: String,
        host: String,
        port: Option<u16>,
        ip: Option<IpAddr>,
    },
    Tuple(FiveTuple),
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.contains("->") {
            return raw.parse().map(Target::Tuple);
        }

        let authority = match raw.split_once("://") {
            Some((_, rest)) => {
                let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
                let authority = &rest[..end];
                // Drop userinfo.
                authority.rsplit_once('@').map_or(authority, |(_, a)| a)
            }
            None => {
                let end = raw.find('/').unwrap_or(raw.len());
                &raw[..end]
            }
        };

        let (host, port) = split_host_port(authority)?;
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let ip = host.parse::<IpAddr>().ok().map(|ip| ip.to_canonical());

        Ok(Target::Address {
            raw: raw.to_string(),
            host,
            port,
            ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_forms() {
        assert_eq!(
            split_host_port("example.com:443").unwrap(),
            ("example.com".into(), Some(443))
        );
        assert_eq!(split_host_port("example.com").unwrap(), ("example.com".into(), None));
        assert_eq!(split_host_port("[::1]:8080").unwrap(), ("::1".into(), Some(8080)));
        assert_eq!(split_host_port("fe80::1").unwrap(), ("fe80::1".into(), None));
        assert!(split_host_port("example.com:http").is_err());
        assert!(split_host_port("").is_err());
    }

    #[test]
    fn url_target_extracts_host() {
        let t = Target::parse("https://user:pw@API.Example.com.:8443/v1?q=1").unwrap();
        match t {
            Target::Address { host, port, ip, .. } => {
                assert_eq!(host, "api.example.com");
                assert_eq!(port, Some(8443));
                assert!(ip.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ip_target_is_canonical() {
        let t = Target::parse("[0:0:0:0:0:0:0:1]:22").unwrap();
        match t {
            Target::Address { ip, .. } => assert_eq!(ip, Some("::1".parse().unwrap())),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn five_tuple() {
        let t: FiveTuple = "TCP:10.0.0.2:51000->192.168.1.10:443:outbound".parse().unwrap();
        assert_eq!(t.protocol, "tcp");
        assert_eq!(t.src_port, 51000);
        assert_eq!(t.dst_ip, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(t.dst_port, 443);
        assert_eq!(t.direction, Direction::Outbound);

        let v6: FiveTuple = "udp:[fd00::2]:5353->[fd00::1]:53:inbound".parse().unwrap();
        assert_eq!(v6.dst_port, 53);
        assert_eq!(v6.direction, Direction::Inbound);

        assert!("tcp:10.0.0.2->10.0.0.3:80:outbound".parse::<FiveTuple>().is_err());
        assert!("tcp:10.0.0.2:1->10.0.0.3:80:sideways".parse::<FiveTuple>().is_err());
    }

    #[test]
    fn port_specs() {
        let single: PortSpec = "443".parse().unwrap();
        assert!(single.contains(443));
        assert!(!single.contains(80));

        let list: PortSpec = "80, 443".parse().unwrap();
        assert!(list.contains(80) && list.contains(443) && !list.contains(8080));

        let range: PortSpec = "1000-2000".parse().unwrap();
        assert!(range.contains(1000) && range.contains(2000) && !range.contains(2001));

        assert!("2000-1000".parse::<PortSpec>().is_err());
        assert!("".parse::<PortSpec>().is_err());
    }

    #[test]
    fn direction_admits() {
        assert!(Direction::Both.admits(Direction::Inbound));
        assert!(Direction::Both.admits(Direction::Outbound));
        assert!(!Direction::Inbound.admits(Direction::Outbound));
    }
}
