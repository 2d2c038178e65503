use std::net::Ipv4Addr;

const BOOTREQUEST: u8 = 1;
const CIADDR_OFFSET: usize = 12;
const MAGIC_COOKIE_OFFSET: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPTIONS_OFFSET: usize = MAGIC_COOKIE_OFFSET + MAGIC_COOKIE.len();

const OPTION_PAD: u8 = 0;
const OPTION_REQUESTED_ADDRESS: u8 = 50;
const OPTION_MESSAGE_TYPE: u8 = 53;
const OPTION_END: u8 = 255;

const DHCPREQUEST: u8 = 3;

/// Extracts the address a client asks for from a DHCPREQUEST.
///
/// The requested-address option wins over `ciaddr`. Anything that is not a
/// well-formed DHCP request yields `None`.
pub(crate) fn requested_address(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < OPTIONS_OFFSET
        || packet[0] != BOOTREQUEST
        || packet[MAGIC_COOKIE_OFFSET..OPTIONS_OFFSET] != MAGIC_COOKIE
    {
        return None;
    }

    let mut message_type = None;
    let mut requested = None;
    let mut options = &packet[OPTIONS_OFFSET..];
    while let Some((&code, rest)) = options.split_first() {
        match code {
            OPTION_PAD => {
                options = rest;
                continue;
            }
            OPTION_END => break,
            _ => {}
        }
        let (&len, rest) = rest.split_first()?;
        let value = rest.get(..len as usize)?;
        match (code, value) {
            (OPTION_MESSAGE_TYPE, [kind]) => message_type = Some(*kind),
            (OPTION_REQUESTED_ADDRESS, &[a, b, c, d]) => requested = Some(Ipv4Addr::new(a, b, c, d)),
            _ => {}
        }
        options = &rest[len as usize..];
    }

    if message_type != Some(DHCPREQUEST) {
        return None;
    }
    requested.or_else(|| {
        let ciaddr = &packet[CIADDR_OFFSET..CIADDR_OFFSET + 4];
        let ciaddr = Ipv4Addr::new(ciaddr[0], ciaddr[1], ciaddr[2], ciaddr[3]);
        (!ciaddr.is_unspecified()).then_some(ciaddr)
    })
}
