//! This crate (Aurelius project module) implements serialization and deserialization APIs for the Border Gateway Protocol (BGP), **the**
//! EGP (Exterior Gateway Protocol) used in the Internet for the exchange of routes between networks. The session layer of the daemon sits
//! on top of this crate and only ever moves [BGPMessage] values in and out of its connection buffers.
//!
//! ## RFCs currently implemented or planned to be implemented
//! | RFC                                                       | Title                                       | Status      |
//! |-----------------------------------------------------------|---------------------------------------------|-------------|
//! | [RFC 3392](https://datatracker.ietf.org/doc/html/rfc3392) | Capabilities Advertisement with BGP-4       | Implemented |
//! | [RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271) | A Border Gateway Protocol 4 (BGP-4)         | Implemented |
//! | [RFC 4724](https://datatracker.ietf.org/doc/html/rfc4724) | Graceful Restart Mechanism for BGP          | Implemented |
//! | [RFC 4760](https://datatracker.ietf.org/doc/html/rfc4760) | Multiprotocol Extensions for BGP-4          | Implemented |
//! | [RFC 6793](https://datatracker.ietf.org/doc/html/rfc6793) | BGP Support for Four-Octet AS Numbers       | Planned     |
//! | [RFC 7313](https://datatracker.ietf.org/doc/html/rfc7313) | Enhanced Route Refresh Capability           | Planned     |
//!
//! ## References
//! - [RFC 4271 - A Border Gateway Protocol 4 (BGP-4)](https://datatracker.ietf.org/doc/html/rfc4271)
//! - [Standards documents, Wikipedia "Border Gateway Protocol"](https://en.wikipedia.org/wiki/Border_Gateway_Protocol#Standards_documents)

#![no_std]
extern crate alloc;
#[cfg(all(feature = "std", test))]
extern crate std;

// BGP base
pub mod prefix;
pub mod rfc4271;

// BGP Extensions
#[cfg(feature = "rfc3392")] pub mod rfc3392;
#[cfg(feature = "rfc4724")] pub mod rfc4724;
#[cfg(feature = "rfc4760")] pub mod rfc4760;
#[cfg(all(feature = "std", test))] pub mod test;

use crate::rfc4271::{
    BGPMessageHeader,
    NotificationMessage,
    OpenMessage,
    UpdateMessage,
};
use alloc::vec::Vec;
use nom::{
    bytes::complete::take,
    multi::many1,
    IResult,
    Parser,
};

/// The synchronization marker every BGP-4 message starts with, 16 bytes of all-ones.
pub const MARKER: [u8; 16] = [0xFF; 16];

/// The fixed size of the message header (marker, length, type).
pub const HEADER_LEN: u16 = 19;

/// The smallest structurally valid OPEN message (header plus version, ASN, hold time, identifier and an empty parameter list).
pub const MIN_OPEN_LEN: u16 = 29;

/// The upper bound RFC 4271 places on any single message.
pub const MAX_MESSAGE_LEN: u16 = 4096;

pub trait BGPElement {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized;
    fn pack(&self) -> Vec<u8>;
}

pub trait ParameterizedBGPElement {
    type Parameter;

    fn unpack(input: &[u8], parameter: Self::Parameter) -> IResult<&[u8], Self>
    where
        Self: Sized;

    fn pack(&self) -> Vec<u8>;
}

/// This enum is a wrapper around the BGP messages provided by this serialization library. It allows the serialization and deserialization
/// of every BGP message received/being sent by the daemon.
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub enum BGPMessage {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
    Unknown {
        kind: u8,
        data: Vec<u8>,
    },
}

impl BGPMessage {
    pub const OPEN: u8 = 1;
    pub const UPDATE: u8 = 2;
    pub const NOTIFICATION: u8 = 3;
    pub const KEEPALIVE: u8 = 4;
}

impl BGPElement for BGPMessage {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, header) = BGPMessageHeader::unpack(input)?;
        let (input, message) = take(header.length.saturating_sub(HEADER_LEN) as usize)(input)?;
        Ok((
            input,
            match header.kind {
                Self::OPEN => Self::Open(OpenMessage::unpack(message)?.1),
                Self::UPDATE => Self::Update(UpdateMessage::unpack(message)?.1),
                Self::NOTIFICATION => Self::Notification(NotificationMessage::unpack(message)?.1),
                Self::KEEPALIVE => Self::KeepAlive,
                _ => {
                    Self::Unknown {
                        kind: header.kind,
                        data: message.to_vec(),
                    }
                }
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let message = match self {
            Self::Open(message) => message.pack(),
            Self::Update(message) => message.pack(),
            Self::Notification(message) => message.pack(),
            Self::KeepAlive => Vec::new(),
            Self::Unknown { data, .. } => data.clone(),
        };

        let mut buffer = BGPMessageHeader {
            marker: MARKER,
            kind: self.kind(),
            length: message.len() as u16 + HEADER_LEN,
        }
        .pack();
        buffer.extend_from_slice(&message);
        buffer
    }
}

impl BGPMessage {
    #[inline(always)]
    pub fn unpack_many(input: &[u8]) -> IResult<&[u8], Vec<Self>> {
        many1(BGPMessage::unpack).parse(input)
    }

    pub fn kind(&self) -> u8 {
        match self {
            Self::Open(_) => Self::OPEN,
            Self::Update(_) => Self::UPDATE,
            Self::Notification(_) => Self::NOTIFICATION,
            Self::KeepAlive => Self::KEEPALIVE,
            Self::Unknown { kind, .. } => *kind,
        }
    }

    /// The smallest wire size a message of the given type can legally have. Used by the session layer to reject framing errors before the
    /// body parser runs.
    pub fn min_length(kind: u8) -> u16 {
        match kind {
            Self::OPEN => MIN_OPEN_LEN,
            Self::UPDATE => HEADER_LEN + 4,
            Self::NOTIFICATION => HEADER_LEN + 2,
            _ => HEADER_LEN,
        }
    }
}
