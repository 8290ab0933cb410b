//! This module of the BGP serialization and deserialization library implements the serialization of the Multiprotocol Extensions in the BGP
//! update message (and the capability) as specified in [RFC 4760](https://datatracker.ietf.org/doc/html/rfc4760). It allows a session that
//! negotiated additional address families to carry their routes next to classic IPv4 unicast.

use crate::{
    prefix::{
        AddressFamily,
        Family,
        SubsequentAddressFamily,
    },
    BGPElement,
    ParameterizedBGPElement,
};
use alloc::vec::Vec;
use aurelius_common::Prefix;
use nom::{
    bytes::complete::take,
    multi::many0,
    number::complete::be_u8,
    IResult,
    Parser,
};

/// This struct represents the multiprotocol capability announced in the open message. One capability instance names one (AFI, SAFI) pair
/// the sender is willing to exchange.
///
/// ## References
/// - [Use of BGP Capability Advertisement, Section 8 RFC 4760](https://datatracker.ietf.org/doc/html/rfc4760#section-8)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone, Copy)]
pub struct MultiprotocolExtensionsCapability {
    pub family: Family,
}

impl BGPElement for MultiprotocolExtensionsCapability {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, afi) = AddressFamily::unpack(input)?;
        let (input, _reserved) = be_u8(input)?;
        let (input, safi) = SubsequentAddressFamily::unpack(input)?;
        Ok((
            input,
            Self {
                family: Family::new(afi, safi),
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend(self.family.afi.pack());
        buffer.extend_from_slice(&0_u8.to_be_bytes());
        buffer.extend(self.family.safi.pack());
        buffer
    }
}

/// This struct represents the multiprotocol reachable NLRI path attribute, announcing routes of a non-IPv4-unicast family together with
/// the next hop to reach them.
///
/// ## References
/// - [Multiprotocol Reachable NLRI - MP_REACH_NLRI, Section 3 RFC 4760](https://datatracker.ietf.org/doc/html/rfc4760#section-3)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub struct MultiprotocolReachNLRI {
    pub family: Family,
    pub next_hop: Vec<u8>,
    pub nlri: Vec<Prefix>,
}

impl BGPElement for MultiprotocolReachNLRI {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, afi) = AddressFamily::unpack(input)?;
        let (input, safi) = SubsequentAddressFamily::unpack(input)?;
        let (input, next_hop_length) = be_u8(input)?;
        let (input, next_hop) = take(next_hop_length as usize)(input)?;
        let (input, _reserved) = be_u8(input)?;
        let (_, nlri) = many0(|input| Prefix::unpack(input, afi)).parse(input)?;
        Ok((
            &[],
            Self {
                family: Family::new(afi, safi),
                next_hop: next_hop.to_vec(),
                nlri,
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend(self.family.afi.pack());
        buffer.extend(self.family.safi.pack());
        buffer.extend_from_slice(&(self.next_hop.len() as u8).to_be_bytes());
        buffer.extend_from_slice(&self.next_hop);
        buffer.extend_from_slice(&0_u8.to_be_bytes());
        for prefix in &self.nlri {
            buffer.extend(prefix.pack());
        }
        buffer
    }
}

/// This struct represents the multiprotocol unreachable NLRI path attribute, withdrawing routes of a non-IPv4-unicast family. An instance
/// without any withdrawn routes is the End-of-RIB marker for the named family.
///
/// ## References
/// - [Multiprotocol Unreachable NLRI - MP_UNREACH_NLRI, Section 4 RFC 4760](https://datatracker.ietf.org/doc/html/rfc4760#section-4)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub struct MultiprotocolUnreachNLRI {
    pub family: Family,
    pub withdrawn_routes: Vec<Prefix>,
}

impl BGPElement for MultiprotocolUnreachNLRI {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, afi) = AddressFamily::unpack(input)?;
        let (input, safi) = SubsequentAddressFamily::unpack(input)?;
        let (_, withdrawn_routes) = many0(|input| Prefix::unpack(input, afi)).parse(input)?;
        Ok((
            &[],
            Self {
                family: Family::new(afi, safi),
                withdrawn_routes,
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend(self.family.afi.pack());
        buffer.extend(self.family.safi.pack());
        for prefix in &self.withdrawn_routes {
            buffer.extend(prefix.pack());
        }
        buffer
    }
}
