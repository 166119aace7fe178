//! DHCP packet decoding and reply encoding per RFC 2131.
//!
//! A DHCP packet consists of a fixed 236-byte header followed by a 4-byte
//! magic cookie and variable-length options. Incoming requests are never
//! parsed into a full struct: the server only needs a handful of fields, so
//! each `decode_*` function reads straight from the received buffer and
//! treats anything inconsistent as "not present". Replies are assembled with
//! [`PacketWriter`].
//!
//! # Packet Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          yiaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          siaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          giaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                          sname (64)                           |
//! +---------------------------------------------------------------+
//! |                          file (128)                           |
//! +---------------------------------------------------------------+
//! |                    magic cookie (4) = 99.130.83.99            |
//! +---------------------------------------------------------------+
//! |                          options (variable)                   |
//! +---------------------------------------------------------------+
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::config::DhcpServerConfig;
use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const XID_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 10;
const CIADDR_OFFSET: usize = 12;
const CHADDR_OFFSET: usize = 28;
const CHADDR_SIZE: usize = 16;
const SNAME_SIZE: usize = 64;
const FILE_SIZE: usize = 128;

/// Offset of the magic cookie, right after the 236-byte fixed header.
pub const MAGIC_COOKIE_OFFSET: usize = 236;

/// Offset of the first option byte.
pub const OPTIONS_OFFSET: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Minimum DHCP packet size per RFC 2131 §2.
///
/// DHCP requires packets to be at least 300 bytes for compatibility
/// with BOOTP relay agents.
pub const DHCP_MIN_PACKET_SIZE: usize = 300;

/// 576 bytes is the minimum datagram all hosts must accept per RFC 791.
const DHCP_ENCODE_CAPACITY: usize = 576;

const BROADCAST_FLAG: u16 = 0x8000;

/// BOOTP/DHCP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP/DHCP operation code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet.
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet (6 bytes).
pub const HLEN_ETHERNET: u8 = 6;

/// A 6-byte Ethernet hardware address, the key of the lease table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = value.split([':', '-']);

        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::InvalidConfig(format!("MAC address too short: {}", value)))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidConfig(format!("Invalid MAC address: {}", value)))?;
        }

        if parts.next().is_some() {
            return Err(Error::InvalidConfig(format!("MAC address too long: {}", value)));
        }

        Ok(Self(bytes))
    }
}

/// Checks that `buf` looks like a BOOTREQUEST carrying DHCP options.
///
/// # Errors
///
/// Returns [`Error::InvalidPacket`] if the buffer is shorter than the fixed
/// header plus cookie, the magic cookie is wrong, or the op code is not
/// [`BOOTREQUEST`].
pub fn validate_request(buf: &[u8]) -> Result<()> {
    if buf.len() < OPTIONS_OFFSET {
        return Err(Error::InvalidPacket(format!(
            "Packet too short: {} bytes (minimum {})",
            buf.len(),
            OPTIONS_OFFSET
        )));
    }

    if buf[MAGIC_COOKIE_OFFSET..OPTIONS_OFFSET] != DHCP_MAGIC_COOKIE {
        return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
    }

    if buf[0] != BOOTREQUEST {
        return Err(Error::InvalidPacket(format!(
            "Unexpected op code {} (not a BOOTREQUEST)",
            buf[0]
        )));
    }

    Ok(())
}

/// Iterates over the raw `(code, data)` pairs of the options region.
///
/// Pad bytes are skipped, End terminates the scan and so does an option
/// whose length would run past the end of the buffer.
struct RawOptions<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> RawOptions<'a> {
    /// `None` when the buffer lacks the fixed header or the magic cookie.
    fn new(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < OPTIONS_OFFSET || buf[MAGIC_COOKIE_OFFSET..OPTIONS_OFFSET] != DHCP_MAGIC_COOKIE
        {
            return None;
        }
        Some(Self {
            data: &buf[OPTIONS_OFFSET..],
            index: 0,
        })
    }
}

impl<'a> Iterator for RawOptions<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.data.len() {
            let code = self.data[self.index];

            if code == OptionCode::Pad as u8 {
                self.index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                self.index = self.data.len();
                return None;
            }

            let length = *self.data.get(self.index + 1)? as usize;
            let start = self.index + 2;
            let end = start + length;
            if end > self.data.len() {
                self.index = self.data.len();
                return None;
            }

            self.index = end;
            return Some((code, &self.data[start..end]));
        }
        None
    }
}

fn find_option(buf: &[u8], code: OptionCode) -> Option<DhcpOption> {
    RawOptions::new(buf)?
        .find(|(option_code, _)| *option_code == code as u8)
        .and_then(|(option_code, data)| DhcpOption::parse(option_code, data).ok())
}

/// Returns the raw value of option 53, the DHCP message type.
///
/// The value is not checked against the known message types so the caller
/// can log unknown ones.
pub fn decode_message_type(buf: &[u8]) -> Option<u8> {
    RawOptions::new(buf)?
        .find(|(code, _)| *code == OptionCode::MessageType as u8)
        .and_then(|(_, data)| match data {
            [value] => Some(*value),
            _ => None,
        })
}

/// Returns the address the client asks for.
///
/// A renewing client puts its current address in `ciaddr`; a client in
/// INIT-REBOOT or SELECTING state uses option 50 instead.
pub fn decode_requested_address(buf: &[u8]) -> Option<Ipv4Addr> {
    if let Some(octets) = buf.get(CIADDR_OFFSET..CIADDR_OFFSET + 4) {
        let ciaddr = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        if !ciaddr.is_unspecified() {
            return Some(ciaddr);
        }
    }

    match find_option(buf, OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(address)) => Some(address),
        _ => None,
    }
}

/// Returns the server identifier (option 54) a client put in its REQUEST.
pub fn decode_server_identifier(buf: &[u8]) -> Option<Ipv4Addr> {
    match find_option(buf, OptionCode::ServerIdentifier) {
        Some(DhcpOption::ServerIdentifier(address)) => Some(address),
        _ => None,
    }
}

/// Returns the client hostname (option 12) if it is non-empty ASCII.
pub fn decode_hostname(buf: &[u8]) -> Option<String> {
    match find_option(buf, OptionCode::Hostname) {
        Some(DhcpOption::Hostname(name)) if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// Returns the first six bytes of `chaddr`.
pub fn decode_client_mac(buf: &[u8]) -> Option<MacAddress> {
    let bytes: [u8; 6] = buf.get(CHADDR_OFFSET..CHADDR_OFFSET + 6)?.try_into().ok()?;
    Some(MacAddress(bytes))
}

/// Builds a DHCP packet front to back.
///
/// The writer tracks its own position, so fields are appended in wire order
/// and options are written as whole TLVs.
#[derive(Debug)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(DHCP_ENCODE_CAPACITY),
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn address(&mut self, address: Ipv4Addr) -> &mut Self {
        self.buf.extend_from_slice(&address.octets());
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Writes `bytes` into a fixed-width field, truncating or zero-filling.
    pub fn fixed(&mut self, bytes: &[u8], width: usize) -> &mut Self {
        let len = bytes.len().min(width);
        self.buf.extend_from_slice(&bytes[..len]);
        self.zeros(width - len)
    }

    pub fn zeros(&mut self, count: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + count, 0);
        self
    }

    pub fn option(&mut self, option: &DhcpOption) -> &mut Self {
        self.buf.extend_from_slice(&option.encode());
        self
    }

    /// Appends the End marker, pads to the BOOTP minimum and returns the packet.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(OptionCode::End as u8);
        if self.buf.len() < DHCP_MIN_PACKET_SIZE {
            self.buf.resize(DHCP_MIN_PACKET_SIZE, 0);
        }
        self.buf
    }
}

/// Builds an OFFER, ACK or NAK for `request`.
///
/// `xid`, the broadcast flag and `chaddr` are copied from the request.
/// `yiaddr` carries `offered` (zero for a NAK) and `siaddr` the server
/// address. A NAK only carries options 53 and 54; OFFER and ACK also carry
/// the subnet mask, lease time, router, DNS servers (when configured) and
/// domain name (when configured).
pub fn encode_response(
    request: &[u8],
    message_type: MessageType,
    offered: Option<Ipv4Addr>,
    config: &DhcpServerConfig,
) -> Vec<u8> {
    let xid = request
        .get(XID_OFFSET..XID_OFFSET + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0);
    let flags = request
        .get(FLAGS_OFFSET..FLAGS_OFFSET + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]) & BROADCAST_FLAG)
        .unwrap_or(0);
    let chaddr = request
        .get(CHADDR_OFFSET..CHADDR_OFFSET + CHADDR_SIZE)
        .unwrap_or(&[]);

    let is_nak = message_type == MessageType::Nak;
    let yiaddr = if is_nak {
        Ipv4Addr::UNSPECIFIED
    } else {
        offered.unwrap_or(Ipv4Addr::UNSPECIFIED)
    };

    let mut writer = PacketWriter::new();
    writer
        .u8(BOOTREPLY)
        .u8(HTYPE_ETHERNET)
        .u8(HLEN_ETHERNET)
        .u8(0)
        .u32(xid)
        .u16(0)
        .u16(flags)
        .address(Ipv4Addr::UNSPECIFIED)
        .address(yiaddr)
        .address(config.server_ip)
        .address(Ipv4Addr::UNSPECIFIED)
        .fixed(chaddr, CHADDR_SIZE)
        .zeros(SNAME_SIZE + FILE_SIZE)
        .bytes(&DHCP_MAGIC_COOKIE)
        .option(&DhcpOption::MessageType(message_type))
        .option(&DhcpOption::ServerIdentifier(config.server_ip));

    if !is_nak {
        writer
            .option(&DhcpOption::SubnetMask(config.subnet_mask()))
            .option(&DhcpOption::LeaseTime(config.lease_duration_seconds))
            .option(&DhcpOption::Router(vec![config.router_address()]));

        if !config.dns_servers.is_empty() {
            writer.option(&DhcpOption::DnsServer(config.dns_servers.clone()));
        }

        if let Some(domain) = config.domain_name.as_ref().filter(|domain| !domain.is_empty()) {
            writer.option(&DhcpOption::DomainName(domain.clone()));
        }
    }

    writer.finish()
}
