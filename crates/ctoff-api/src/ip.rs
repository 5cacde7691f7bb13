// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_GRE: u8 = 47;

/// The L4 protocol of a connection.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Protocol {
    TCP,
    UDP,
    GRE,
    Unknown(u8),
}

impl Protocol {
    /// Does this protocol carry source/destination ports?
    pub fn has_ports(&self) -> bool {
        matches!(self, Self::TCP | Self::UDP)
    }
}

impl From<u8> for Protocol {
    fn from(proto: u8) -> Self {
        match proto {
            IP_PROTO_TCP => Self::TCP,
            IP_PROTO_UDP => Self::UDP,
            IP_PROTO_GRE => Self::GRE,
            p => Self::Unknown(p),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        match proto {
            Protocol::TCP => IP_PROTO_TCP,
            Protocol::UDP => IP_PROTO_UDP,
            Protocol::GRE => IP_PROTO_GRE,
            Protocol::Unknown(p) => p,
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::GRE => write!(f, "GRE"),
            Self::Unknown(p) => write!(f, "{p}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrFamily {
    Ipv4,
    Ipv6,
}

/// The source and destination address of a connection direction.
///
/// Both addresses always belong to the same family.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum AddrPair {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

impl AddrPair {
    pub fn family(&self) -> AddrFamily {
        match self {
            Self::V4 { .. } => AddrFamily::Ipv4,
            Self::V6 { .. } => AddrFamily::Ipv6,
        }
    }

    pub fn src(&self) -> IpAddr {
        match self {
            Self::V4 { src, .. } => IpAddr::V4(*src),
            Self::V6 { src, .. } => IpAddr::V6(*src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            Self::V4 { dst, .. } => IpAddr::V4(*dst),
            Self::V6 { dst, .. } => IpAddr::V6(*dst),
        }
    }

    pub fn mirror(&self) -> Self {
        match *self {
            Self::V4 { src, dst } => Self::V4 { src: dst, dst: src },
            Self::V6 { src, dst } => Self::V6 { src: dst, dst: src },
        }
    }

    /// Replace the source address, or return `None` if `ip` belongs
    /// to another family.
    pub fn with_src(&self, ip: IpAddr) -> Option<Self> {
        match (*self, ip) {
            (Self::V4 { dst, .. }, IpAddr::V4(src)) => Some(Self::V4 { src, dst }),
            (Self::V6 { dst, .. }, IpAddr::V6(src)) => Some(Self::V6 { src, dst }),
            _ => None,
        }
    }

    /// Replace the destination address, or return `None` if `ip`
    /// belongs to another family.
    pub fn with_dst(&self, ip: IpAddr) -> Option<Self> {
        match (*self, ip) {
            (Self::V4 { src, .. }, IpAddr::V4(dst)) => Some(Self::V4 { src, dst }),
            (Self::V6 { src, .. }, IpAddr::V6(dst)) => Some(Self::V6 { src, dst }),
            _ => None,
        }
    }
}

/// The normalized identity of one direction of a connection.
///
/// Ports are zero for protocols which do not carry them. The zone is
/// part of the identity: identical 5-tuples in different zones are
/// different connections.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Tuple {
    pub proto: Protocol,
    pub addrs: AddrPair,
    pub src_port: u16,
    pub dst_port: u16,
    pub zone: u16,
}

impl Tuple {
    pub fn new_v4(
        proto: Protocol,
        src: (Ipv4Addr, u16),
        dst: (Ipv4Addr, u16),
        zone: u16,
    ) -> Self {
        Self::normalized(
            proto,
            AddrPair::V4 { src: src.0, dst: dst.0 },
            src.1,
            dst.1,
            zone,
        )
    }

    pub fn new_v6(
        proto: Protocol,
        src: (Ipv6Addr, u16),
        dst: (Ipv6Addr, u16),
        zone: u16,
    ) -> Self {
        Self::normalized(
            proto,
            AddrPair::V6 { src: src.0, dst: dst.0 },
            src.1,
            dst.1,
            zone,
        )
    }

    fn normalized(
        proto: Protocol,
        addrs: AddrPair,
        src_port: u16,
        dst_port: u16,
        zone: u16,
    ) -> Self {
        let (src_port, dst_port) =
            if proto.has_ports() { (src_port, dst_port) } else { (0, 0) };
        Self { proto, addrs, src_port, dst_port, zone }
    }

    /// The tuple of the opposite direction: addresses and ports
    /// swapped, protocol and zone unchanged.
    pub fn reverse(&self) -> Self {
        Self {
            proto: self.proto,
            addrs: self.addrs.mirror(),
            src_port: self.dst_port,
            dst_port: self.src_port,
            zone: self.zone,
        }
    }

    pub fn family(&self) -> AddrFamily {
        self.addrs.family()
    }
}

impl Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addrs {
            AddrPair::V4 { src, dst } => write!(
                f,
                "{}:{}:{}:{}:{}/z{}",
                self.proto, src, self.src_port, dst, self.dst_port, self.zone
            ),
            AddrPair::V6 { src, dst } => write!(
                f,
                "{}:[{}]:{}:[{}]:{}/z{}",
                self.proto, src, self.src_port, dst, self.dst_port, self.zone
            ),
        }
    }
}

/// Address and port rewrites already decided by the connection
/// tracker for a NAT'd connection. Every field left as `None` is kept
/// as-is.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct NatRewrite {
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl NatRewrite {
    pub fn is_empty(&self) -> bool {
        self.src_ip.is_none()
            && self.dst_ip.is_none()
            && self.src_port.is_none()
            && self.dst_port.is_none()
    }

    pub fn rewrites_ports(&self) -> bool {
        self.src_port.is_some() || self.dst_port.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reverse_swaps_endpoints_only() {
        let t = Tuple::new_v4(
            Protocol::TCP,
            ("10.0.0.1".parse().unwrap(), 1234),
            ("10.0.0.2".parse().unwrap(), 80),
            7,
        );
        let r = t.reverse();
        assert_eq!(r.addrs.src(), t.addrs.dst());
        assert_eq!(r.addrs.dst(), t.addrs.src());
        assert_eq!((r.src_port, r.dst_port), (80, 1234));
        assert_eq!(r.zone, 7);
        assert_eq!(r.reverse(), t);
    }

    #[test]
    fn portless_protocols_drop_ports() {
        let t = Tuple::new_v4(
            Protocol::GRE,
            ("10.0.0.1".parse().unwrap(), 1234),
            ("10.0.0.2".parse().unwrap(), 80),
            0,
        );
        assert_eq!((t.src_port, t.dst_port), (0, 0));
    }

    #[test]
    fn zone_is_part_of_identity() {
        let a = Tuple::new_v4(
            Protocol::UDP,
            ("10.0.0.1".parse().unwrap(), 53),
            ("10.0.0.2".parse().unwrap(), 53),
            1,
        );
        let b = Tuple { zone: 2, ..a };
        assert_ne!(a, b);
    }

    #[test]
    fn replace_addr_checks_family() {
        let pair = AddrPair::V4 {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
        };
        assert!(pair.with_src("fd00::1".parse().unwrap()).is_none());
        let out = pair.with_dst("192.168.1.1".parse().unwrap()).unwrap();
        assert_eq!(out.dst(), "192.168.1.1".parse::<IpAddr>().unwrap());
    }
}
