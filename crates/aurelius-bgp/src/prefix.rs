use crate::ParameterizedBGPElement;
use alloc::vec::Vec;
use core::{
    cmp::min,
    fmt::{
        Display,
        Formatter,
    },
    net::{
        IpAddr,
        Ipv4Addr,
        Ipv6Addr,
    },
};
use nom::{
    bytes::complete::take,
    error::{
        Error,
        ErrorKind,
    },
    number::complete::be_u8,
    IResult,
};
use aurelius_common::{
    type_enum,
    Prefix,
};

type_enum! {
    /// This value represents the address family carried in the Multiprotocol Extensions associated attributes and capabilities. Currently
    /// we only support IPv4 and IPv6.
    ///
    /// ## References
    /// - [Address Family Numbers, IANA](https://www.iana.org/assignments/address-family-numbers/address-family-numbers.xhtml)
    #[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone, Copy)]
    pub enum AddressFamily: be_u16(u16) {
        IPv4 = 1,
        IPv6 = 2
    }
}

type_enum! {
    /// This enum represents all SAFI (Subsequent address family identifier) values supported by this BGP implementation, currently Unicast
    /// and Multicast.
    ///
    /// ## References
    /// - [Subsequent Address Family Identifier, Section 6 RFC 4760](https://datatracker.ietf.org/doc/html/rfc4760#section-6)
    #[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone, Copy)]
    pub enum SubsequentAddressFamily: be_u8(u8) {
        Unicast = 1,
        Multicast = 2
    }
}

/// An (AFI, SAFI) pair. Session negotiation intersects the families both peers announced, and End-of-RIB markers are emitted once per
/// negotiated family.
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone, Copy)]
pub struct Family {
    pub afi: AddressFamily,
    pub safi: SubsequentAddressFamily,
}

impl Family {
    pub const IPV4_UNICAST: Family = Family {
        afi: AddressFamily::IPv4,
        safi: SubsequentAddressFamily::Unicast,
    };
    pub const IPV6_UNICAST: Family = Family {
        afi: AddressFamily::IPv6,
        safi: SubsequentAddressFamily::Unicast,
    };

    pub const fn new(afi: AddressFamily, safi: SubsequentAddressFamily) -> Self {
        Self { afi, safi }
    }

    pub fn for_address(address: IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => Self::IPV4_UNICAST,
            IpAddr::V6(_) => Self::IPV6_UNICAST,
        }
    }
}

impl Display for Family {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> core::fmt::Result {
        write!(formatter, "{} {}", self.afi, self.safi)
    }
}

impl ParameterizedBGPElement for Prefix {
    type Parameter = AddressFamily;

    fn unpack(input: &[u8], parameter: AddressFamily) -> IResult<&[u8], Prefix> {
        let (input, mask) = be_u8(input)?;
        let (input, prefix) = take((mask as usize + 7) / 8)(input)?;
        Ok((
            input,
            Prefix {
                address: unpack_ip_address(prefix, parameter)?.1,
                mask,
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&self.mask.to_be_bytes());
        match self.address {
            IpAddr::V4(addr) => buffer.extend_from_slice(&addr.octets()[0..self.masked_len()]),
            IpAddr::V6(addr) => buffer.extend_from_slice(&addr.octets()[0..self.masked_len()]),
        }
        buffer
    }
}

pub fn unpack_ip_address(input: &[u8], address_family: AddressFamily) -> IResult<&[u8], IpAddr> {
    fn slice_to_array<const N: usize>(input: &[u8]) -> IResult<&[u8], [u8; N]> {
        let mut array = [0u8; N];
        let read = min(input.len(), N);
        let (input, bytes) = take(read)(input)?;
        array[0..read].copy_from_slice(bytes);
        Ok((input, array))
    }

    match address_family {
        AddressFamily::IPv4 => {
            let (input, bytes) = slice_to_array::<4>(input)?;
            Ok((input, IpAddr::V4(Ipv4Addr::from(bytes))))
        }
        AddressFamily::IPv6 => {
            let (input, bytes) = slice_to_array::<16>(input)?;
            Ok((input, IpAddr::V6(Ipv6Addr::from(bytes))))
        }
        _ => Err(nom::Err::Error(Error::new(input, ErrorKind::Complete))),
    }
}
