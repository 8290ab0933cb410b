//! This module of the BGP serialization and deserialization library implements the Graceful Restart capability as specified in
//! [RFC 4724](https://datatracker.ietf.org/doc/html/rfc4724). A session that negotiated this capability may be closed without a
//! notification so the peer keeps forwarding state while the speaker restarts.

use crate::{
    prefix::{
        AddressFamily,
        Family,
        SubsequentAddressFamily,
    },
    BGPElement,
};
use alloc::vec::Vec;
use nom::{
    multi::many0,
    number::complete::{
        be_u16,
        be_u8,
    },
    IResult,
    Parser,
};

/// The "Restart State" bit in the restart flags nibble, set when the sender restarted and is replaying its previous session.
const RESTART_STATE: u16 = 0x8000;

/// The "Forwarding State" bit in the per-family flags, set when forwarding state for the family survived the restart.
pub const FORWARDING_STATE: u8 = 0x80;

/// One family entry of the graceful restart capability.
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone, Copy)]
pub struct RestartFamily {
    pub family: Family,
    pub flags: u8,
}

impl BGPElement for RestartFamily {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, afi) = AddressFamily::unpack(input)?;
        let (input, safi) = SubsequentAddressFamily::unpack(input)?;
        let (input, flags) = be_u8(input)?;
        Ok((
            input,
            Self {
                family: Family::new(afi, safi),
                flags,
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend(self.family.afi.pack());
        buffer.extend(self.family.safi.pack());
        buffer.extend_from_slice(&self.flags.to_be_bytes());
        buffer
    }
}

/// This struct represents the graceful restart capability announced in the open message. It carries the restart state flag, the time the
/// peer should wait for the session to re-establish, and the families whose forwarding state is preserved across a restart.
///
/// ## References
/// - [Graceful Restart Capability, Section 3 RFC 4724](https://datatracker.ietf.org/doc/html/rfc4724#section-3)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub struct GracefulRestartCapability {
    pub restart_state: bool,
    pub restart_time: u16,
    pub families: Vec<RestartFamily>,
}

impl BGPElement for GracefulRestartCapability {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, flags_and_time) = be_u16(input)?;
        let (_, families) = many0(RestartFamily::unpack).parse(input)?;
        Ok((
            &[],
            Self {
                restart_state: flags_and_time & RESTART_STATE != 0,
                restart_time: flags_and_time & 0x0FFF,
                families,
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut flags_and_time = self.restart_time & 0x0FFF;
        if self.restart_state {
            flags_and_time |= RESTART_STATE;
        }

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&flags_and_time.to_be_bytes());
        for family in &self.families {
            buffer.extend(family.pack());
        }
        buffer
    }
}
