#![no_std]
extern crate alloc;

pub mod macros;

use alloc::string::{
    String,
    ToString,
};
use core::{
    fmt::{
        Debug,
        Display,
        Formatter,
    },
    net::{
        AddrParseError,
        IpAddr,
        Ipv4Addr,
        Ipv6Addr,
    },
    num::ParseIntError,
    str::FromStr,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommonError {
    #[error("Expected format <address>/<mask> (a.e. 10.0.0.0/8), but got '{0}'")]
    InvalidPrefixFormat(String),
    #[error("The mask /{0} is too long for the address {1}")]
    InvalidMaskLength(u8, IpAddr),
    #[error("Unable to parse address => '{0}'")]
    IpAddrParse(#[from] AddrParseError),
    #[error("Unable to parse int => '{0}'")]
    IntParse(#[from] ParseIntError),
}

/// This value represents an IPv6/IPv4 network prefix, the unit of reachability a BGP speaker announces and withdraws. The daemon carries
/// prefixes from the neighbor configuration into UPDATE messages and back out of received UPDATE messages.
#[derive(Ord, PartialOrd, Eq, PartialEq, Hash, Clone, Copy)]
pub struct Prefix {
    pub address: IpAddr,
    pub mask: u8,
}

impl FromStr for Prefix {
    type Err = CommonError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let (addr, mask) = string.split_once("/").ok_or(CommonError::InvalidPrefixFormat(string.to_string()))?;
        let address = IpAddr::from_str(addr)?;
        let mask = mask.parse()?;
        let limit = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if mask > limit {
            return Err(CommonError::InvalidMaskLength(mask, address));
        }
        Ok(Self { address, mask })
    }
}

impl Debug for Prefix {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> core::fmt::Result {
        write!(formatter, "{}/{}", self.address, self.mask)
    }
}

impl Display for Prefix {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> core::fmt::Result {
        write!(formatter, "{}/{}", self.address, self.mask)
    }
}

impl Prefix {
    pub const ANY_IPV4: Prefix = Prefix {
        address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        mask: 0,
    };
    pub const ANY_IPV6: Prefix = Prefix {
        address: IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0)),
        mask: 0,
    };

    /// The count of bytes the masked part of the address occupies on the wire.
    pub const fn masked_len(&self) -> usize {
        (self.mask as usize + 7) / 8
    }
}
