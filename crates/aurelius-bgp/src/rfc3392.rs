//! This module of the BGP serialization and deserialization library implements the serialization of capabilities in the BGP open message as
//! specified in [RFC 3392](https://datatracker.ietf.org/doc/html/rfc3392). It allows a router to tell its peer about the supported features
//! and extensions before the session reaches the established state.

#[cfg(feature = "rfc4724")]
use crate::rfc4724::GracefulRestartCapability;
#[cfg(feature = "rfc4760")]
use crate::rfc4760::MultiprotocolExtensionsCapability;
use crate::BGPElement;
use alloc::vec::Vec;
use nom::{
    bytes::complete::take,
    number::complete::be_u8,
    IResult,
};

/// The capability code for the Multiprotocol Extensions capability assigned by IANA.
pub const CAPABILITY_MULTIPROTOCOL: u8 = 1;

/// The capability code for the Graceful Restart capability assigned by IANA.
pub const CAPABILITY_GRACEFUL_RESTART: u8 = 64;

/// This enum represents a capability. Capabilities are sent in the open message of the BGP router to tell the other peer about the features
/// and supported extensions of this BGP router.
///
/// ## References
/// - [Capabilities Optional Parameter, Section 4 RFC 3392](https://datatracker.ietf.org/doc/html/rfc3392#section-4)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub enum Capability {
    #[cfg(feature = "rfc4760")]
    MultiprotocolExtensions(MultiprotocolExtensionsCapability),
    #[cfg(feature = "rfc4724")]
    GracefulRestart(GracefulRestartCapability),
    Unknown {
        code: u8,
        data: Vec<u8>,
    },
}

impl BGPElement for Capability {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, code) = be_u8(input)?;
        let (input, length) = be_u8(input)?;
        let (input, data) = take(length as usize)(input)?;
        Ok((
            input,
            match code {
                #[cfg(feature = "rfc4760")]
                CAPABILITY_MULTIPROTOCOL => Self::MultiprotocolExtensions(MultiprotocolExtensionsCapability::unpack(data)?.1),
                #[cfg(feature = "rfc4724")]
                CAPABILITY_GRACEFUL_RESTART => Self::GracefulRestart(GracefulRestartCapability::unpack(data)?.1),
                _ => Self::Unknown { code, data: data.to_vec() },
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let (code, data) = match self {
            #[cfg(feature = "rfc4760")]
            Self::MultiprotocolExtensions(capability) => (CAPABILITY_MULTIPROTOCOL, capability.pack()),
            #[cfg(feature = "rfc4724")]
            Self::GracefulRestart(capability) => (CAPABILITY_GRACEFUL_RESTART, capability.pack()),
            Self::Unknown { code, data } => (*code, data.clone()),
        };

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&code.to_be_bytes());
        buffer.extend_from_slice(&(data.len() as u8).to_be_bytes());
        buffer.extend(data);
        buffer
    }
}

impl Capability {
    /// The IANA capability code of this capability.
    pub fn code(&self) -> u8 {
        match self {
            #[cfg(feature = "rfc4760")]
            Self::MultiprotocolExtensions(_) => CAPABILITY_MULTIPROTOCOL,
            #[cfg(feature = "rfc4724")]
            Self::GracefulRestart(_) => CAPABILITY_GRACEFUL_RESTART,
            Self::Unknown { code, .. } => *code,
        }
    }
}
