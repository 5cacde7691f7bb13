// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Build raw IP packets for the restore path.

use ctoff::api::AddrPair;
use ctoff::api::Protocol;
use ctoff::api::Tuple;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Address;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv6Address;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::TcpPacket;
use smoltcp::wire::UdpPacket;

pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;
pub const GRE_HDR_LEN: usize = 4;

/// The L4 header of a packet matching `t`, with `body` appended.
fn l4(t: &Tuple, body: &[u8]) -> Vec<u8> {
    let hdr_len = match t.proto {
        Protocol::TCP => TCP_HDR_LEN,
        Protocol::UDP => UDP_HDR_LEN,
        _ => GRE_HDR_LEN,
    };
    let mut buf = vec![0u8; hdr_len + body.len()];
    buf[hdr_len..].copy_from_slice(body);

    match t.proto {
        Protocol::TCP => {
            let mut tcp = TcpPacket::new_unchecked(&mut buf[..]);
            tcp.set_src_port(t.src_port);
            tcp.set_dst_port(t.dst_port);
            tcp.set_header_len(TCP_HDR_LEN as u8);
            tcp.set_ack(true);
            tcp.set_window_len(64240);
        }

        Protocol::UDP => {
            let len = buf.len() as u16;
            let mut udp = UdpPacket::new_unchecked(&mut buf[..]);
            udp.set_src_port(t.src_port);
            udp.set_dst_port(t.dst_port);
            udp.set_len(len);
        }

        // A bare GRE header carrying IPv4.
        _ => buf[2..4].copy_from_slice(&0x0800u16.to_be_bytes()),
    }

    buf
}

/// An IPv4 or IPv6 packet for the connection direction `t`.
pub fn packet_for(t: &Tuple) -> Vec<u8> {
    packet_with_body(t, &[])
}

pub fn packet_with_body(t: &Tuple, body: &[u8]) -> Vec<u8> {
    let l4 = l4(t, body);
    let proto = IpProtocol::from(u8::from(t.proto));

    match t.addrs {
        AddrPair::V4 { src, dst } => {
            let mut buf = vec![0u8; IPV4_HDR_LEN + l4.len()];
            let total = buf.len() as u16;
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.set_version(4);
            ip.set_header_len(IPV4_HDR_LEN as u8);
            ip.set_total_len(total);
            ip.set_hop_limit(64);
            ip.set_next_header(proto);
            ip.set_src_addr(Ipv4Address::from_bytes(&src.octets()));
            ip.set_dst_addr(Ipv4Address::from_bytes(&dst.octets()));
            ip.fill_checksum();
            ip.payload_mut().copy_from_slice(&l4);
            buf
        }

        AddrPair::V6 { src, dst } => {
            let mut buf = vec![0u8; IPV6_HDR_LEN + l4.len()];
            let mut ip = Ipv6Packet::new_unchecked(&mut buf[..]);
            ip.set_version(6);
            ip.set_payload_len(l4.len() as u16);
            ip.set_hop_limit(64);
            ip.set_next_header(proto);
            ip.set_src_addr(Ipv6Address::from_bytes(&src.octets()));
            ip.set_dst_addr(Ipv6Address::from_bytes(&dst.octets()));
            ip.payload_mut().copy_from_slice(&l4);
            buf
        }
    }
}

/// A non-first IPv4 fragment of a packet for `t`.
pub fn v4_fragment_for(t: &Tuple) -> Vec<u8> {
    let mut pkt = packet_for(t);
    let mut ip = Ipv4Packet::new_unchecked(&mut pkt[..]);
    ip.set_frag_offset(8);
    ip.fill_checksum();
    pkt
}
