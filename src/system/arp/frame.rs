use std::net::Ipv4Addr;

use pnet::{
    packet::{
        arp::{Arp, ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket},
        ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket},
        FromPacket, Packet,
    },
    util::MacAddr,
};

use crate::error::{Error, Result};

pub(super) const ETH_PACK_LEN: usize = 42;
const ARP_PACK_LEN: usize = 28;
const MAC_ADDR_LEN: u8 = 6;
const IP_V4_LEN: u8 = 4;

/// Builds a broadcast ARP request asking who has `target_ip`.
pub(super) fn request(
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Result<[u8; ETH_PACK_LEN]> {
    let mut arp_buf = [0; ARP_PACK_LEN];
    let mut arp_packet = MutableArpPacket::new(&mut arp_buf)
        .ok_or(Error::Opaque("ARP buffer too small".into()))?;
    arp_packet.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp_packet.set_protocol_type(EtherTypes::Ipv4);
    arp_packet.set_hw_addr_len(MAC_ADDR_LEN);
    arp_packet.set_proto_addr_len(IP_V4_LEN);
    arp_packet.set_operation(ArpOperations::Request);
    arp_packet.set_sender_hw_addr(sender_mac);
    arp_packet.set_sender_proto_addr(sender_ip);
    arp_packet.set_target_hw_addr(MacAddr::zero());
    arp_packet.set_target_proto_addr(target_ip);

    let mut eth_buf = [0; ETH_PACK_LEN];
    let mut eth_packet = MutableEthernetPacket::new(&mut eth_buf)
        .ok_or(Error::Opaque("Ethernet buffer too small".into()))?;
    eth_packet.set_destination(MacAddr::broadcast());
    eth_packet.set_source(sender_mac);
    eth_packet.set_ethertype(EtherTypes::Arp);
    eth_packet.set_payload(arp_packet.packet());
    Ok(eth_buf)
}

pub(super) fn parse(bytes: &[u8]) -> Result<Arp> {
    let ethernet_packet =
        EthernetPacket::new(bytes).ok_or(Error::Opaque("failed to parse Ethernet frame".into()))?;
    if ethernet_packet.get_ethertype() != EtherTypes::Arp {
        return Err(Error::Opaque("not an ARP frame".into()));
    }
    ArpPacket::new(ethernet_packet.payload())
        .map(|packet| packet.from_packet())
        .ok_or(Error::Opaque("failed to parse ARP packet".into()))
}
