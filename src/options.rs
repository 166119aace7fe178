//! DHCP options understood by the ZTalk DHCP server (RFC 2132 subset).
//!
//! Options are TLV encoded: one code byte, one length byte, then `length`
//! bytes of data. Only the options the server reads from clients or writes
//! into its replies are modelled; everything else is carried as
//! [`DhcpOption::Unknown`].

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Option data carries a 1-byte length, so at most 63 IPv4 addresses fit.
pub const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// DHCP option codes used by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding, no length byte follows.
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    RequestedIpAddress = 50,
    /// Lease time in seconds, big-endian u32.
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    /// End of options marker, no length byte follows.
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::Hostname),
            15 => Ok(Self::DomainName),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types (Option 53).
///
/// The server acts on DISCOVER, REQUEST and RELEASE and answers with
/// OFFER, ACK or NAK. DECLINE and INFORM are recognised so they can be
/// logged by name, then dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    /// Any option this server does not interpret.
    Unknown(u8, Vec<u8>),
}

fn parse_address(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    match data {
        [a, b, c, d] => Ok(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => Err(Error::InvalidPacket(format!("Invalid {} length", what))),
    }
}

fn parse_address_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if !data.len().is_multiple_of(4) || data.is_empty() {
        return Err(Error::InvalidPacket(format!("Invalid {} option length", what)));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn encode_bytes(code: OptionCode, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(255);
    let mut result = vec![code as u8, len as u8];
    result.extend_from_slice(&data[..len]);
    result
}

fn encode_address_list(code: OptionCode, addrs: &[Ipv4Addr]) -> Vec<u8> {
    let count = addrs.len().min(MAX_ADDRESSES_PER_OPTION);
    let mut result = vec![code as u8, (count * 4) as u8];
    for addr in addrs.iter().take(count) {
        result.extend_from_slice(&addr.octets());
    }
    result
}

impl DhcpOption {
    /// Returns the option code for this option.
    pub fn option_code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::Hostname(_) => OptionCode::Hostname as u8,
            Self::DomainName(_) => OptionCode::DomainName as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    /// Parses a DHCP option from its code and raw data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data length does not fit the
    /// option (addresses must be exactly 4 bytes, the message type exactly 1),
    /// if a hostname is not ASCII, or if the message type value is unknown.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(parse_address(data, "subnet mask")?)),
            Ok(OptionCode::Router) => Ok(Self::Router(parse_address_list(data, "router")?)),
            Ok(OptionCode::DnsServer) => {
                Ok(Self::DnsServer(parse_address_list(data, "DNS server")?))
            }
            Ok(OptionCode::Hostname) => {
                if !data.is_ascii() {
                    return Err(Error::InvalidPacket("Hostname is not ASCII".to_string()));
                }
                let name = String::from_utf8_lossy(data)
                    .trim_end_matches('\0')
                    .to_string();
                Ok(Self::Hostname(name))
            }
            Ok(OptionCode::DomainName) => {
                let name = String::from_utf8_lossy(data).to_string();
                Ok(Self::DomainName(name))
            }
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(parse_address(
                data,
                "requested IP address",
            )?)),
            Ok(OptionCode::LeaseTime) => match data {
                [a, b, c, d] => Ok(Self::LeaseTime(u32::from_be_bytes([*a, *b, *c, *d]))),
                _ => Err(Error::InvalidPacket("Invalid lease time length".to_string())),
            },
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                }
                let msg_type = MessageType::try_from(data[0]).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(msg_type))
            }
            Ok(OptionCode::ServerIdentifier) => Ok(Self::ServerIdentifier(parse_address(
                data,
                "server identifier",
            )?)),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::InvalidPacket(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    /// Encodes the option to its wire format (code + length + data).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr) => encode_bytes(OptionCode::SubnetMask, &addr.octets()),
            Self::Router(addrs) => encode_address_list(OptionCode::Router, addrs),
            Self::DnsServer(addrs) => encode_address_list(OptionCode::DnsServer, addrs),
            Self::Hostname(name) => encode_bytes(OptionCode::Hostname, name.as_bytes()),
            Self::DomainName(name) => encode_bytes(OptionCode::DomainName, name.as_bytes()),
            Self::RequestedIpAddress(addr) => {
                encode_bytes(OptionCode::RequestedIpAddress, &addr.octets())
            }
            Self::LeaseTime(time) => encode_bytes(OptionCode::LeaseTime, &time.to_be_bytes()),
            Self::MessageType(msg_type) => {
                vec![OptionCode::MessageType as u8, 1, *msg_type as u8]
            }
            Self::ServerIdentifier(addr) => {
                encode_bytes(OptionCode::ServerIdentifier, &addr.octets())
            }
            Self::Unknown(code, data) => {
                let len = data.len().min(255);
                let mut result = vec![*code, len as u8];
                result.extend_from_slice(&data[..len]);
                result
            }
        }
    }
}
