//! This file implements the [RFC 4271 - A Border Gateway Protocol 4 (BGP-4)](https://datatracker.ietf.org/doc/html/rfc4271), the base RFC
//! of the BGP protocol which is specifying the message formats exchanged over a session.

#[cfg(feature = "rfc3392")]
use crate::rfc3392::Capability;
#[cfg(feature = "rfc4760")]
use crate::rfc4760::{
    MultiprotocolReachNLRI,
    MultiprotocolUnreachNLRI,
};
use crate::{
    prefix::{
        AddressFamily,
        Family,
    },
    BGPElement,
    ParameterizedBGPElement,
};
use alloc::{
    string::String,
    vec::Vec,
};
use aurelius_common::Prefix;
use bitflags::bitflags;
use core::net::IpAddr;
use nom::{
    bytes::complete::take,
    error::{
        Error,
        ErrorKind,
    },
    multi::{
        many0,
        many_m_n,
    },
    number::complete::{
        be_u16,
        be_u32,
        be_u8,
    },
    IResult,
    Parser,
};

#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub struct BGPMessageHeader {
    pub marker: [u8; 16],
    pub length: u16,
    pub kind: u8,
}

impl BGPElement for BGPMessageHeader {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, marker) = take(16usize)(input)?;
        let (input, length) = be_u16(input)?;
        let (input, kind) = be_u8(input)?;
        Ok((
            input,
            Self {
                marker: marker.try_into().unwrap(),
                length,
                kind,
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = self.marker.to_vec();
        buffer.extend_from_slice(&self.length.to_be_bytes());
        buffer.extend_from_slice(&self.kind.to_be_bytes());
        buffer
    }
}

/// Optional parameters are sent with the open message of the BGP router to tell the other peer some extra information. A.e. the router's
/// capability list is sent as an optional parameter.
///
/// ## References
/// - [OPEN Message Format, Section 4.2 RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271#section-4.2)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub enum OptionalParameter {
    #[cfg(feature = "rfc3392")]
    Capabilities(Vec<Capability>),
    Unknown {
        kind: u8,
        data: Vec<u8>,
    },
}

impl BGPElement for OptionalParameter {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, kind) = be_u8(input)?;
        let (input, length) = be_u8(input)?;
        let (input, data) = take(length as usize)(input)?;
        Ok((
            input,
            match kind {
                #[cfg(feature = "rfc3392")]
                2 => Self::Capabilities(many0(Capability::unpack).parse(data)?.1),
                _ => Self::Unknown { kind, data: data.to_vec() },
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            #[cfg(feature = "rfc3392")]
            Self::Capabilities(capabilities) => {
                let mut capabilities_data = Vec::new();
                for capability in capabilities {
                    capabilities_data.extend(capability.pack());
                }

                buffer.extend_from_slice(&2_u8.to_be_bytes());
                buffer.extend_from_slice(&(capabilities_data.len() as u8).to_be_bytes());
                buffer.extend(capabilities_data);
            }
            Self::Unknown { kind, data } => {
                buffer.extend_from_slice(&kind.to_be_bytes());
                buffer.extend_from_slice(&(data.len() as u8).to_be_bytes());
                buffer.extend(data);
            }
        }
        buffer
    }
}

/// This struct represents the BGP open message. The open message is sent between two BGP peers to initialize the connection and exchange
/// information about the router (supported extensions/capabilities etc.) to the other peer. It contains the BGP protocol version, this
/// library only supports BGP-4.
///
/// ## References
/// - [OPEN Message Format, Section 4.2 RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271#section-4.2)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub struct OpenMessage {
    pub version: u8,
    pub autonomous_system: u16,
    pub hold_time: u16,
    pub bgp_identifier: u32,
    pub optional_parameters: Vec<OptionalParameter>,
}

impl BGPElement for OpenMessage {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, version) = be_u8(input)?;
        let (input, autonomous_system) = be_u16(input)?;
        let (input, hold_time) = be_u16(input)?;
        let (input, bgp_identifier) = be_u32(input)?;
        let (input, optional_parameters_length) = be_u8(input)?;
        let (input, optional_parameters) = take(optional_parameters_length as usize)(input)?;
        Ok((
            input,
            Self {
                version,
                autonomous_system,
                hold_time,
                bgp_identifier,
                optional_parameters: many0(OptionalParameter::unpack).parse(optional_parameters)?.1,
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&self.version.to_be_bytes());
        buffer.extend_from_slice(&self.autonomous_system.to_be_bytes());
        buffer.extend_from_slice(&self.hold_time.to_be_bytes());
        buffer.extend_from_slice(&self.bgp_identifier.to_be_bytes());

        let mut optional_parameters_data = Vec::new();
        for optional_parameter in &self.optional_parameters {
            optional_parameters_data.extend(optional_parameter.pack());
        }
        buffer.extend_from_slice(&(optional_parameters_data.len() as u8).to_be_bytes());
        buffer.extend(optional_parameters_data);
        buffer
    }
}

impl OpenMessage {
    /// All capabilities advertised by this open message, across all capability optional parameters.
    #[cfg(feature = "rfc3392")]
    pub fn capabilities(&self) -> Vec<&Capability> {
        self.optional_parameters
            .iter()
            .filter_map(|parameter| {
                if let OptionalParameter::Capabilities(capabilities) = parameter {
                    Some(capabilities.iter())
                } else {
                    None
                }
            })
            .flatten()
            .collect()
    }

    /// Whether this open message announced a capability with the given code.
    #[cfg(feature = "rfc3392")]
    pub fn announced(&self, code: u8) -> bool {
        self.capabilities().iter().any(|capability| capability.code() == code)
    }
}

bitflags! {
    /// This structure contains the flags of a path attribute.
    ///
    /// ## References
    /// - [UPDATE Message Format, Section 4.3 RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271#section-4.3)
    #[derive(Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Copy)]
    pub struct PathAttributeFlags: u8 {
        /// This attribute flag indicates whether the path attribute is optional (1) or well-known (0).
        const OPTIONAL = 0b1000_0000;

        /// This attribute flag indicates whether the path attribute is transitive (1) or non-transitive (0). Well-known attributes require
        /// that the transitive bit is being set.
        const TRANSITIVE  = 0b0100_0000;

        /// This attribute flag indicates whether the information in the path attribute is partial (1) or complete (0).
        const PARTIAL = 0b0010_0000;

        /// This attribute flag indicates whether the path attribute's length should be encoded as 2-byte value (1) or as 1-byte value (0).
        const EXTENDED_LENGTH = 0b0001_0000;
    }
}

/// Origin is a well-known mandatory attribute that defines the origin of the path information.
///
/// ## References
/// - [ORIGIN Path Attribute Usage, Section 5.1.1 RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271#section-5.1.1)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone, Copy)]
#[repr(u8)]
pub enum Origin {
    IGP = 0,
    EGP = 1,
    Incomplete = 2,
}

impl From<u8> for Origin {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::IGP,
            1 => Self::EGP,
            _ => Self::Incomplete,
        }
    }
}

impl From<&Origin> for u8 {
    fn from(value: &Origin) -> Self {
        *value as u8
    }
}

/// One segment of the AS_PATH attribute, an ordered sequence or an unordered set of the autonomous systems a route has traversed.
///
/// ## References
/// - [AS_PATH Path Attribute Usage, Section 5.1.2 RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271#section-5.1.2)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub enum ASPathSegment {
    Set(Vec<u16>),
    Sequence(Vec<u16>),
}

impl BGPElement for ASPathSegment {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, kind) = be_u8(input)?;
        let (input, length) = be_u8(input)?;
        let (input, members) = many_m_n(length as usize, length as usize, be_u16).parse(input)?;
        match kind {
            1 => Ok((input, Self::Set(members))),
            2 => Ok((input, Self::Sequence(members))),
            _ => Err(nom::Err::Error(Error::new(input, ErrorKind::Tag))),
        }
    }

    fn pack(&self) -> Vec<u8> {
        let (kind, members) = match self {
            Self::Set(members) => (1_u8, members),
            Self::Sequence(members) => (2_u8, members),
        };

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&kind.to_be_bytes());
        buffer.extend_from_slice(&(members.len() as u8).to_be_bytes());
        for member in members {
            buffer.extend_from_slice(&member.to_be_bytes());
        }
        buffer
    }
}

/// This enum represents the path attributes sent in a BGP update message. Path attributes are providing information about the prefixes
/// being sent to the peer like the path origin, the traversed autonomous systems and the next hop.
///
/// ## References
/// - [UPDATE Message Format, Section 4.3 RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271#section-4.3)
/// - [Path Attributes, Section 5 RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271#section-5)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub enum PathAttribute {
    Origin(Origin),
    AsPath(Vec<ASPathSegment>),
    NextHop(IpAddr),
    MultiExitDisc(u32),
    LocalPref(u32),
    #[cfg(feature = "rfc4760")]
    MpReachNlri(MultiprotocolReachNLRI),
    #[cfg(feature = "rfc4760")]
    MpUnreachNlri(MultiprotocolUnreachNLRI),
    Unknown {
        kind: u8,
        flags: PathAttributeFlags,
        data: Vec<u8>,
    },
}

impl BGPElement for PathAttribute {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, flags) = be_u8(input)?;
        let flags = PathAttributeFlags::from_bits(flags).ok_or(nom::Err::Error(Error::new(input, ErrorKind::Tag)))?;
        let (input, kind) = be_u8(input)?;

        // Following the parser rules for path attributes in section 4.3 of RFC 4271, the length is an u16 when the extended length flag
        // is applied. Otherwise, the length is just one byte.
        let (input, length) = if !flags.contains(PathAttributeFlags::EXTENDED_LENGTH) {
            let (input, length) = be_u8(input)?;
            (input, length as u16)
        } else {
            be_u16(input)?
        };

        let (input, data) = take(length)(input)?;
        Ok((
            input,
            match kind {
                1 => Self::Origin(Origin::from(be_u8(data)?.1)),
                2 => Self::AsPath(many0(ASPathSegment::unpack).parse(data)?.1),
                3 => {
                    let family = match length {
                        4 => AddressFamily::IPv4,
                        16 => AddressFamily::IPv6,
                        _ => return Err(nom::Err::Error(Error::new(input, ErrorKind::Fail))),
                    };
                    Self::NextHop(crate::prefix::unpack_ip_address(data, family)?.1)
                }
                4 => Self::MultiExitDisc(be_u32(data)?.1),
                5 => Self::LocalPref(be_u32(data)?.1),
                #[cfg(feature = "rfc4760")]
                14 => Self::MpReachNlri(MultiprotocolReachNLRI::unpack(data)?.1),
                #[cfg(feature = "rfc4760")]
                15 => Self::MpUnreachNlri(MultiprotocolUnreachNLRI::unpack(data)?.1),
                _ => {
                    Self::Unknown {
                        kind,
                        flags,
                        data: data.to_vec(),
                    }
                }
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        fn attribute(flags: PathAttributeFlags, kind: u8, data: Vec<u8>) -> Vec<u8> {
            let extended = data.len() > u8::MAX as usize;
            let flags = if extended {
                flags.union(PathAttributeFlags::EXTENDED_LENGTH)
            } else {
                flags
            };

            let mut buffer = Vec::new();
            buffer.extend_from_slice(&flags.bits().to_be_bytes());
            buffer.extend_from_slice(&kind.to_be_bytes());
            if extended {
                buffer.extend_from_slice(&(data.len() as u16).to_be_bytes());
            } else {
                buffer.extend_from_slice(&(data.len() as u8).to_be_bytes());
            }
            buffer.extend(data);
            buffer
        }

        match self {
            Self::Origin(origin) => attribute(PathAttributeFlags::TRANSITIVE, 1, alloc::vec![u8::from(origin)]),
            Self::AsPath(segments) => {
                let mut data = Vec::new();
                for segment in segments {
                    data.extend(segment.pack());
                }
                attribute(PathAttributeFlags::TRANSITIVE, 2, data)
            }
            Self::NextHop(next_hop) => {
                attribute(
                    PathAttributeFlags::TRANSITIVE,
                    3,
                    match next_hop {
                        IpAddr::V4(addr) => addr.octets().to_vec(),
                        IpAddr::V6(addr) => addr.octets().to_vec(),
                    },
                )
            }
            Self::MultiExitDisc(value) => attribute(PathAttributeFlags::OPTIONAL, 4, value.to_be_bytes().to_vec()),
            Self::LocalPref(value) => attribute(PathAttributeFlags::TRANSITIVE, 5, value.to_be_bytes().to_vec()),
            #[cfg(feature = "rfc4760")]
            Self::MpReachNlri(nlri) => attribute(PathAttributeFlags::OPTIONAL, 14, nlri.pack()),
            #[cfg(feature = "rfc4760")]
            Self::MpUnreachNlri(nlri) => attribute(PathAttributeFlags::OPTIONAL, 15, nlri.pack()),
            Self::Unknown { kind, flags, data } => attribute(*flags, *kind, data.clone()),
        }
    }
}

/// This struct represents the BGP update message. The update message is sent after the establishment of the connection to exchange route
/// information with the BGP peer like Network Layer Reachability Information (NLRI, newly reachable routes) together with information
/// about the prefixes itself (path attributes).
///
/// ## References
/// - [UPDATE Message Format, Section 4.3 RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271#section-4.3)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub struct UpdateMessage {
    pub withdrawn_routes: Vec<Prefix>,
    pub path_attributes: Vec<PathAttribute>,
    pub nlri: Vec<Prefix>,
}

impl BGPElement for UpdateMessage {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, withdrawn_routes_length) = be_u16(input)?;
        let (input, withdrawn_routes) = take(withdrawn_routes_length as usize)(input)?;
        let (input, path_attributes_length) = be_u16(input)?;
        let (nlri, path_attributes) = take(path_attributes_length as usize)(input)?;
        let (_, path_attributes) = many0(PathAttribute::unpack).parse(path_attributes)?;

        Ok((
            &[],
            Self {
                withdrawn_routes: many0(|input| Prefix::unpack(input, AddressFamily::IPv4)).parse(withdrawn_routes)?.1,
                path_attributes,
                nlri: many0(|input| Prefix::unpack(input, AddressFamily::IPv4)).parse(nlri)?.1,
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        let mut withdrawn_routes_buffer = Vec::new();
        self.withdrawn_routes
            .iter()
            .for_each(|prefix| withdrawn_routes_buffer.extend(prefix.pack()));
        buffer.extend_from_slice(&(withdrawn_routes_buffer.len() as u16).to_be_bytes());
        buffer.extend(withdrawn_routes_buffer);

        // Write path attributes
        let mut path_attr_buffer = Vec::new();
        for path_attribute in &self.path_attributes {
            path_attr_buffer.extend_from_slice(&path_attribute.pack());
        }

        buffer.extend_from_slice(&(path_attr_buffer.len() as u16).to_be_bytes());
        buffer.extend_from_slice(&path_attr_buffer);

        // Write NLRI and return
        let mut nlri_buffer = Vec::new();
        self.nlri.iter().for_each(|prefix| nlri_buffer.extend(prefix.pack()));
        buffer.extend(nlri_buffer);
        buffer
    }
}

impl UpdateMessage {
    /// An update that announces and withdraws nothing at all.
    pub fn empty() -> Self {
        Self {
            withdrawn_routes: Vec::new(),
            path_attributes: Vec::new(),
            nlri: Vec::new(),
        }
    }

    /// The End-of-RIB marker for the given family. For IPv4 unicast this is the completely empty update; for every other family it is an
    /// update whose only content is an empty MP_UNREACH_NLRI attribute naming the family.
    ///
    /// ## References
    /// - [Marker for End-of-RIB, Section 2 RFC 4724](https://datatracker.ietf.org/doc/html/rfc4724#section-2)
    #[cfg(feature = "rfc4760")]
    pub fn end_of_rib(family: Family) -> Self {
        if family == Family::IPV4_UNICAST {
            return Self::empty();
        }
        Self {
            withdrawn_routes: Vec::new(),
            path_attributes: alloc::vec![PathAttribute::MpUnreachNlri(MultiprotocolUnreachNLRI {
                family,
                withdrawn_routes: Vec::new(),
            })],
            nlri: Vec::new(),
        }
    }

    /// The count of routes this update carries, announced and withdrawn, across the base and the multiprotocol attributes.
    pub fn route_count(&self) -> usize {
        let mut count = self.withdrawn_routes.len() + self.nlri.len();
        #[cfg(feature = "rfc4760")]
        for path_attribute in &self.path_attributes {
            match path_attribute {
                PathAttribute::MpReachNlri(nlri) => count += nlri.nlri.len(),
                PathAttribute::MpUnreachNlri(nlri) => count += nlri.withdrawn_routes.len(),
                _ => {}
            }
        }
        count
    }

    /// Whether this update is an End-of-RIB marker, for any family.
    pub fn is_end_of_rib(&self) -> bool {
        if !self.withdrawn_routes.is_empty() || !self.nlri.is_empty() {
            return false;
        }
        match self.path_attributes.as_slice() {
            [] => true,
            #[cfg(feature = "rfc4760")]
            [PathAttribute::MpUnreachNlri(nlri)] => nlri.withdrawn_routes.is_empty(),
            _ => false,
        }
    }
}

/// This struct represents the BGP notification message. The notification message is sent to inform a peer about an error while processing
/// the session or the peer's routes, and closes the session.
///
/// ## References
/// - [NOTIFICATION Message Format, Section 4.5 RFC 4271](https://datatracker.ietf.org/doc/html/rfc4271#section-4.5)
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Hash, Clone)]
pub struct NotificationMessage {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

impl BGPElement for NotificationMessage {
    fn unpack(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (input, error_code) = be_u8(input)?;
        let (data, error_subcode) = be_u8(input)?;
        Ok((
            &[],
            Self {
                error_code,
                error_subcode,
                data: data.to_vec(),
            },
        ))
    }

    fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&self.error_code.to_be_bytes());
        buffer.extend_from_slice(&self.error_subcode.to_be_bytes());
        buffer.extend_from_slice(&self.data);
        buffer
    }
}

impl NotificationMessage {
    pub const MESSAGE_HEADER_ERROR: u8 = 1;
    pub const OPEN_MESSAGE_ERROR: u8 = 2;
    pub const UPDATE_MESSAGE_ERROR: u8 = 3;
    pub const HOLD_TIMER_EXPIRED: u8 = 4;
    pub const FSM_ERROR: u8 = 5;
    pub const CEASE: u8 = 6;

    /// A notification with a human-readable diagnostic in the data field.
    pub fn new(error_code: u8, error_subcode: u8, diagnostic: &str) -> Self {
        Self {
            error_code,
            error_subcode,
            data: diagnostic.as_bytes().to_vec(),
        }
    }

    /// The diagnostic data rendered as text where possible.
    pub fn diagnostic(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}
