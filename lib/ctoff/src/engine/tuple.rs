// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Building and checking connection tuples.

use super::Result;
use ctoff_api::CtFlowReq;
use ctoff_api::NatRewrite;
use ctoff_api::OffloadError;
use ctoff_api::Protocol;
use ctoff_api::Tuple;
use smoltcp::wire::IpVersion;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::TcpPacket;
use smoltcp::wire::UdpPacket;
use std::borrow::Cow;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

/// Clear the ports of a tuple whose protocol has none. They are never
/// matched in hardware nor parsed from packets.
pub fn normalize(req: &CtFlowReq) -> Cow<'_, CtFlowReq> {
    let t = &req.tuple;
    if t.proto.has_ports() || (t.src_port, t.dst_port) == (0, 0) {
        return Cow::Borrowed(req);
    }

    let mut req = req.clone();
    req.tuple.src_port = 0;
    req.tuple.dst_port = 0;
    Cow::Owned(req)
}

/// Reject requests outside of what the offload path can express.
pub fn validate(req: &CtFlowReq) -> Result<()> {
    let proto = req.tuple.proto;
    if !matches!(proto, Protocol::TCP | Protocol::UDP | Protocol::GRE) {
        return Err(OffloadError::Unsupported(format!(
            "protocol {proto} cannot be offloaded"
        )));
    }

    let Some(nat) = req.nat.as_ref() else {
        return Ok(());
    };

    if nat.rewrites_ports() && !proto.has_ports() {
        return Err(OffloadError::Unsupported(format!(
            "port rewrite on portless protocol {proto}"
        )));
    }

    Ok(())
}

/// Apply the decided rewrites to `tuple`. Without rewrites the NAT
/// tuple is the tuple itself.
pub fn nat_tuple(tuple: &Tuple, nat: Option<&NatRewrite>) -> Result<Tuple> {
    let Some(nat) = nat else {
        return Ok(*tuple);
    };

    let mismatch = || {
        OffloadError::Unsupported(format!(
            "NAT address family does not match {tuple}"
        ))
    };

    let mut out = *tuple;
    if let Some(ip) = nat.src_ip {
        out.addrs = out.addrs.with_src(ip).ok_or_else(mismatch)?;
    }
    if let Some(ip) = nat.dst_ip {
        out.addrs = out.addrs.with_dst(ip).ok_or_else(mismatch)?;
    }
    if tuple.proto.has_ports() {
        out.src_port = nat.src_port.unwrap_or(out.src_port);
        out.dst_port = nat.dst_port.unwrap_or(out.dst_port);
    }
    Ok(out)
}

/// Parse the IP and L4 headers at the start of `pkt` into a tuple in
/// `zone`. Returns `None` for anything that could never match an
/// offloaded connection: truncated headers, non-first fragments, or
/// an unsupported protocol.
pub fn tuple_from_packet(pkt: &[u8], zone: u16) -> Option<Tuple> {
    // The version check indexes the first byte unchecked.
    pkt.first()?;
    match IpVersion::of_packet(pkt).ok()? {
        IpVersion::Ipv4 => {
            let ip = Ipv4Packet::new_checked(pkt).ok()?;
            if ip.frag_offset() != 0 {
                return None;
            }
            let proto = Protocol::from(u8::from(ip.next_header()));
            let (sport, dport) = l4_ports(proto, ip.payload())?;
            Some(Tuple::new_v4(
                proto,
                (Ipv4Addr::from(ip.src_addr().0), sport),
                (Ipv4Addr::from(ip.dst_addr().0), dport),
                zone,
            ))
        }

        IpVersion::Ipv6 => {
            let ip = Ipv6Packet::new_checked(pkt).ok()?;
            let proto = Protocol::from(u8::from(ip.next_header()));
            let (sport, dport) = l4_ports(proto, ip.payload())?;
            Some(Tuple::new_v6(
                proto,
                (Ipv6Addr::from(ip.src_addr().0), sport),
                (Ipv6Addr::from(ip.dst_addr().0), dport),
                zone,
            ))
        }
    }
}

fn l4_ports(proto: Protocol, l4: &[u8]) -> Option<(u16, u16)> {
    match proto {
        Protocol::TCP => {
            let tcp = TcpPacket::new_checked(l4).ok()?;
            Some((tcp.src_port(), tcp.dst_port()))
        }
        Protocol::UDP => {
            let udp = UdpPacket::new_checked(l4).ok()?;
            Some((udp.src_port(), udp.dst_port()))
        }
        Protocol::GRE => Some((0, 0)),
        Protocol::Unknown(_) => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ctoff_api::CtCookie;
    use ctoff_api::RestoreCookie;

    fn tcp4() -> Tuple {
        Tuple::new_v4(
            Protocol::TCP,
            ("10.0.0.1".parse().unwrap(), 5000),
            ("10.0.0.2".parse().unwrap(), 80),
            1,
        )
    }

    #[test]
    fn nat_applies_rewrites() {
        let nat = NatRewrite {
            src_ip: Some("192.168.1.1".parse().unwrap()),
            src_port: Some(6000),
            ..Default::default()
        };
        let out = nat_tuple(&tcp4(), Some(&nat)).unwrap();
        assert_eq!(out.addrs.src(), "192.168.1.1".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(out.src_port, 6000);
        assert_eq!(out.dst_port, 80);
        assert_eq!(out.zone, 1);
        assert_eq!(nat_tuple(&tcp4(), None).unwrap(), tcp4());
    }

    #[test]
    fn nat_family_mismatch() {
        let nat = NatRewrite {
            dst_ip: Some("fd00::1".parse().unwrap()),
            ..Default::default()
        };
        assert!(matches!(
            nat_tuple(&tcp4(), Some(&nat)),
            Err(OffloadError::Unsupported(_))
        ));
    }

    #[test]
    fn validate_rejects_unsupported() {
        let mut req = CtFlowReq::new(CtCookie(1), tcp4(), RestoreCookie(1));
        assert!(validate(&req).is_ok());

        req.tuple.proto = Protocol::Unknown(132);
        assert!(matches!(validate(&req), Err(OffloadError::Unsupported(_))));

        req.tuple = Tuple::new_v4(
            Protocol::GRE,
            ("10.0.0.1".parse().unwrap(), 0),
            ("10.0.0.2".parse().unwrap(), 0),
            1,
        );
        assert!(validate(&req).is_ok());
        req.nat = Some(NatRewrite { dst_port: Some(1), ..Default::default() });
        assert!(matches!(validate(&req), Err(OffloadError::Unsupported(_))));
    }

    #[test]
    fn portless_tuples_drop_their_ports() {
        let tcp = CtFlowReq::new(CtCookie(1), tcp4(), RestoreCookie(1));
        assert!(matches!(normalize(&tcp), Cow::Borrowed(_)));

        let gre = Tuple { proto: Protocol::GRE, src_port: 7, dst_port: 9, ..tcp4() };
        let req = CtFlowReq::new(CtCookie(2), gre, RestoreCookie(1));
        let out = normalize(&req);
        assert_eq!((out.tuple.src_port, out.tuple.dst_port), (0, 0));
        assert_eq!(out.tuple.addrs, gre.addrs);
        assert_eq!(out.cookie, CtCookie(2));
    }

    #[test]
    fn garbage_is_not_a_tuple() {
        assert_eq!(tuple_from_packet(&[], 1), None);
        assert_eq!(tuple_from_packet(&[0x45, 0, 0], 1), None);
        assert_eq!(tuple_from_packet(&[0x10; 64], 1), None);
    }
}
