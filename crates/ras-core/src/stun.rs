//! Minimal STUN client (RFC 5389 binding requests)
//!
//! Only what reflexive address discovery needs: build a binding request,
//! validate the response and read (XOR-)MAPPED-ADDRESS.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::error::ConnectionError;

/// STUN magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const HEADER_SIZE: usize = 20;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const BINDING_ERROR_RESPONSE: u16 = 0x0111;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

/// STUN transaction identifier
pub type TransactionId = [u8; 12];

/// Why a datagram was not a usable binding response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    /// Not a STUN message at all
    #[error("not a STUN message")]
    NotStun,

    /// A STUN message for some other transaction
    #[error("transaction id mismatch")]
    TransactionMismatch,

    /// Server answered with an error
    #[error("binding error response")]
    ErrorResponse,

    /// Declared lengths exceed the datagram
    #[error("truncated STUN message")]
    Truncated,

    /// No mapped address attribute
    #[error("no mapped address in response")]
    NoAddress,

    /// Address attribute with an unknown family
    #[error("unsupported address family {0}")]
    UnsupportedFamily(u8),
}

/// Fresh random transaction id
pub fn new_transaction_id() -> TransactionId {
    let mut id = [0u8; 12];
    OsRng.fill_bytes(&mut id);
    id
}

/// Encode a binding request with no attributes
pub fn binding_request(transaction_id: &TransactionId) -> [u8; HEADER_SIZE] {
    let mut packet = [0u8; HEADER_SIZE];
    packet[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length 0: no attributes
    packet[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet[8..20].copy_from_slice(transaction_id);
    packet
}

/// Whether `datagram` looks like a STUN message (so it is not a protocol frame)
pub fn is_stun_message(datagram: &[u8]) -> bool {
    datagram.len() >= HEADER_SIZE
        && datagram[0] & 0xC0 == 0
        && datagram[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// Encode a binding success response carrying XOR-MAPPED-ADDRESS
pub fn binding_response(transaction_id: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
    let xored = xor_address(mapped, transaction_id);
    let mut value = vec![0u8, 0];
    let port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match xored {
        IpAddr::V4(ip) => {
            value[1] = FAMILY_V4;
            value.extend_from_slice(&port.to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            value[1] = FAMILY_V6;
            value.extend_from_slice(&port.to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
    }

    let mut packet = Vec::with_capacity(HEADER_SIZE + 4 + value.len());
    packet.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    packet.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);
    packet.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    packet.extend_from_slice(&(value.len() as u16).to_be_bytes());
    packet.extend_from_slice(&value);
    packet
}

fn xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> IpAddr {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            for (b, k) in octets.iter_mut().zip(cookie.iter()) {
                *b ^= k;
            }
            IpAddr::from(octets)
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            let key = cookie.iter().chain(transaction_id.iter());
            for (b, k) in octets.iter_mut().zip(key) {
                *b ^= k;
            }
            IpAddr::from(octets)
        }
    }
}

fn read_address(
    value: &[u8],
    xored: bool,
    transaction_id: &TransactionId,
) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Truncated);
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xored {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        FAMILY_V4 => {
            let octets: [u8; 4] = value
                .get(4..8)
                .and_then(|s| s.try_into().ok())
                .ok_or(StunError::Truncated)?;
            IpAddr::from(octets)
        }
        FAMILY_V6 => {
            let octets: [u8; 16] = value
                .get(4..20)
                .and_then(|s| s.try_into().ok())
                .ok_or(StunError::Truncated)?;
            IpAddr::from(octets)
        }
        other => return Err(StunError::UnsupportedFamily(other)),
    };

    let addr = SocketAddr::new(ip, port);
    if xored {
        // XOR is its own inverse
        Ok(SocketAddr::new(xor_address(addr, transaction_id), port))
    } else {
        Ok(addr)
    }
}

/// Parse a binding response for `transaction_id`.
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present.
pub fn parse_binding_response(
    datagram: &[u8],
    transaction_id: &TransactionId,
) -> Result<SocketAddr, StunError> {
    if !is_stun_message(datagram) {
        return Err(StunError::NotStun);
    }
    if datagram[8..20] != transaction_id[..] {
        return Err(StunError::TransactionMismatch);
    }

    match u16::from_be_bytes([datagram[0], datagram[1]]) {
        BINDING_RESPONSE => {}
        BINDING_ERROR_RESPONSE => return Err(StunError::ErrorResponse),
        _ => return Err(StunError::NotStun),
    }

    let length = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
    let body = datagram
        .get(HEADER_SIZE..HEADER_SIZE + length)
        .ok_or(StunError::Truncated)?;

    let mut mapped = None;
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body
            .get(offset + 4..offset + 4 + attr_len)
            .ok_or(StunError::Truncated)?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return read_address(value, true, transaction_id),
            ATTR_MAPPED_ADDRESS if mapped.is_none() => {
                mapped = Some(read_address(value, false, transaction_id)?);
            }
            _ => {}
        }

        // attributes are padded to 4 bytes
        offset += 4 + ((attr_len + 3) & !3);
    }

    mapped.ok_or(StunError::NoAddress)
}

async fn query_server(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout: Duration,
) -> Result<SocketAddr, ConnectionError> {
    let transaction_id = new_transaction_id();
    socket.send_to(&binding_request(&transaction_id), server).await?;

    let mut buf = [0u8; 512];
    let wait = async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from != server {
                continue;
            }
            match parse_binding_response(&buf[..len], &transaction_id) {
                Ok(addr) => return Ok(addr),
                Err(StunError::NotStun | StunError::TransactionMismatch) => continue,
                Err(e) => {
                    return Err(ConnectionError::Unreachable(format!(
                        "STUN server {}: {}",
                        server, e
                    )))
                }
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| ConnectionError::Timeout(timeout))?
}

/// Discover the public (reflexive) address of `socket`.
///
/// Servers are tried in order; each gets `timeout`. The same socket must be
/// used for hole punching afterwards so the NAT mapping matches.
pub async fn discover_reflexive(
    socket: &UdpSocket,
    servers: &[String],
    timeout: Duration,
) -> Result<SocketAddr, ConnectionError> {
    let local = socket.local_addr()?;

    for server in servers {
        let addrs = match tokio::net::lookup_host(server.as_str()).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("Failed to resolve STUN server {}: {}", server, e);
                continue;
            }
        };

        for addr in addrs.filter(|a| a.is_ipv4() == local.is_ipv4()) {
            match query_server(socket, addr, timeout).await {
                Ok(reflexive) => {
                    info!("STUN {} reports reflexive address {}", server, reflexive);
                    return Ok(reflexive);
                }
                Err(e) => debug!("STUN query to {} failed: {}", addr, e),
            }
        }
    }

    Err(ConnectionError::Unreachable(
        "no STUN server answered".to_string(),
    ))
}
