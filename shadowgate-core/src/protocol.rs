use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

pub const HEADER_TYPE_CLIENT_STREAM: u8 = 0;
pub const HEADER_TYPE_SERVER_STREAM: u8 = 1;

/// Fixed request header: type (1) + timestamp (8) + length (2).
pub const FIXED_REQUEST_HEADER_LEN: usize = 11;

/// Largest payload one length-prefixed record can carry.
pub const MAX_CHUNK_LEN: usize = u16::MAX as usize;

/// Accepted clock skew between client and server, in either direction.
pub const MAX_TIMESTAMP_SKEW_SECS: u64 = 30;

const ADDR_TYPE_IPV4: u8 = 0x01;
const ADDR_TYPE_DOMAIN: u8 = 0x03;
const ADDR_TYPE_IPV6: u8 = 0x04;

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn validate_timestamp(timestamp: u64, now: u64) -> Result<()> {
    if now.abs_diff(timestamp) > MAX_TIMESTAMP_SKEW_SECS {
        return Err(Error::StaleTimestamp { timestamp, now });
    }
    Ok(())
}

/// Target address carried in the variable-length request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Socket address (IP:port)
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

/// First plaintext of the client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedLengthRequestHeader {
    pub timestamp: u64,
    /// Ciphertext length of the upcoming variable header, tag excluded.
    pub length: u16,
}

impl FixedLengthRequestHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_REQUEST_HEADER_LEN {
            return Err(Error::TruncatedHeader {
                needed: FIXED_REQUEST_HEADER_LEN,
                got: buf.len(),
            });
        }
        if buf[0] != HEADER_TYPE_CLIENT_STREAM {
            return Err(Error::UnexpectedHeaderType {
                expected: HEADER_TYPE_CLIENT_STREAM,
                got: buf[0],
            });
        }
        let timestamp = u64::from_be_bytes(buf[1..9].try_into().map_err(|_| {
            Error::TruncatedHeader {
                needed: FIXED_REQUEST_HEADER_LEN,
                got: buf.len(),
            }
        })?);
        let length = u16::from_be_bytes([buf[9], buf[10]]);
        Ok(Self { timestamp, length })
    }

    pub fn encode(&self) -> [u8; FIXED_REQUEST_HEADER_LEN] {
        let mut out = [0u8; FIXED_REQUEST_HEADER_LEN];
        out[0] = HEADER_TYPE_CLIENT_STREAM;
        out[1..9].copy_from_slice(&self.timestamp.to_be_bytes());
        out[9..11].copy_from_slice(&self.length.to_be_bytes());
        out
    }
}

/// Second plaintext of the client stream: target, padding, and whatever
/// application bytes the client piggybacked on the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableLengthRequestHeader {
    pub target: TargetAddr,
    pub padding_length: u16,
    pub initial_payload: Vec<u8>,
}

impl VariableLengthRequestHeader {
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.is_empty() {
            return Err(Error::TruncatedHeader { needed: 1, got: 0 });
        }
        let (target, addr_len) = match block[0] {
            ADDR_TYPE_IPV4 => {
                if block.len() < 7 {
                    return Err(Error::TruncatedHeader { needed: 7, got: block.len() });
                }
                let ip = Ipv4Addr::new(block[1], block[2], block[3], block[4]);
                let port = u16::from_be_bytes([block[5], block[6]]);
                (TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7)
            }
            ADDR_TYPE_DOMAIN => {
                if block.len() < 2 {
                    return Err(Error::TruncatedHeader { needed: 2, got: block.len() });
                }
                let len = block[1] as usize;
                if block.len() < 2 + len + 2 {
                    return Err(Error::TruncatedHeader {
                        needed: 2 + len + 2,
                        got: block.len(),
                    });
                }
                let domain = String::from_utf8(block[2..2 + len].to_vec())
                    .map_err(|_| Error::InvalidDomainEncoding)?;
                let port = u16::from_be_bytes([block[2 + len], block[3 + len]]);
                (TargetAddr::Domain(domain, port), 4 + len)
            }
            ADDR_TYPE_IPV6 => {
                if block.len() < 19 {
                    return Err(Error::TruncatedHeader { needed: 19, got: block.len() });
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&block[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([block[17], block[18]]);
                (TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port)), 19)
            }
            other => return Err(Error::UnknownAddressType(other)),
        };

        if block.len() < addr_len + 2 {
            return Err(Error::TruncatedHeader {
                needed: addr_len + 2,
                got: block.len(),
            });
        }
        let padding_length = u16::from_be_bytes([block[addr_len], block[addr_len + 1]]);
        let payload_start = addr_len + 2 + padding_length as usize;
        if block.len() < payload_start {
            return Err(Error::TruncatedHeader {
                needed: payload_start,
                got: block.len(),
            });
        }
        let initial_payload = block[payload_start..].to_vec();

        if padding_length == 0 && initial_payload.is_empty() {
            return Err(Error::NoInitialPayloadOrPadding);
        }

        Ok(Self {
            target,
            padding_length,
            initial_payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.initial_payload.len());
        match &self.target {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                out.push(ADDR_TYPE_IPV4);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                out.push(ADDR_TYPE_IPV6);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                out.push(ADDR_TYPE_DOMAIN);
                out.push(domain.len() as u8);
                out.extend_from_slice(domain.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
        out.extend_from_slice(&self.padding_length.to_be_bytes());
        out.extend_from_slice(&vec![0u8; self.padding_length as usize]);
        out.extend_from_slice(&self.initial_payload);
        out
    }
}

/// First plaintext of the server stream. Echoing the request salt binds
/// the response to the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedLengthResponseHeader {
    pub timestamp: u64,
    pub request_salt: Vec<u8>,
    /// Ciphertext length of the first response payload record, tag excluded.
    pub length: u16,
}

impl FixedLengthResponseHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_REQUEST_HEADER_LEN + self.request_salt.len());
        out.push(HEADER_TYPE_SERVER_STREAM);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.request_salt);
        out.extend_from_slice(&self.length.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8], salt_len: usize) -> Result<Self> {
        let needed = FIXED_REQUEST_HEADER_LEN + salt_len;
        if buf.len() < needed {
            return Err(Error::TruncatedHeader { needed, got: buf.len() });
        }
        if buf[0] != HEADER_TYPE_SERVER_STREAM {
            return Err(Error::UnexpectedHeaderType {
                expected: HEADER_TYPE_SERVER_STREAM,
                got: buf[0],
            });
        }
        let timestamp = u64::from_be_bytes(buf[1..9].try_into().map_err(|_| {
            Error::TruncatedHeader { needed, got: buf.len() }
        })?);
        let request_salt = buf[9..9 + salt_len].to_vec();
        let length = u16::from_be_bytes([buf[9 + salt_len], buf[10 + salt_len]]);
        Ok(Self {
            timestamp,
            request_salt,
            length,
        })
    }
}
