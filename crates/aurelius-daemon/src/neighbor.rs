use crate::BGP_PORT;
use aurelius_bgp::{
    prefix::Family,
    rfc4271::{
        ASPathSegment,
        Origin,
        PathAttribute,
        UpdateMessage,
    },
    rfc4760::MultiprotocolReachNLRI,
};
use aurelius_common::Prefix;
use std::{
    fmt::{
        Display,
        Formatter,
    },
    net::{
        IpAddr,
        Ipv4Addr,
    },
};

/// Per-neighbor switches for the out-of-process API.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiOptions {
    /// Whether session up/down transitions of this neighbor are announced over the process bridge.
    pub neighbor_changes: bool,
}

/// One route this speaker announces to a neighbor, taken from the configuration or pushed through the out-of-process API.
#[derive(Debug, Clone, Copy)]
pub struct StaticRoute {
    pub prefix: Prefix,
    pub next_hop: IpAddr,
}

/// The configuration record of one BGP neighbor. The configuration layer produces these; the session core only consumes them. A peer
/// keeps its record across restart cycles until a replacement is installed at a restart boundary.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub peer_address: IpAddr,
    pub port: u16,
    pub peer_as: u16,
    pub local_as: u16,
    pub router_id: Ipv4Addr,
    /// The hold time we propose in our OPEN; the session runs at the minimum of both proposals.
    pub hold_time: u16,
    /// A passive peer never initiates the outbound half-session.
    pub passive: bool,
    /// Whether the graceful restart capability is advertised and a negotiated session closes silently.
    pub graceful_restart: bool,
    pub api: ApiOptions,
    /// The address families offered in our multiprotocol capability.
    pub families: Vec<Family>,
    pub routes: Vec<StaticRoute>,
}

impl Neighbor {
    pub fn new(peer_address: IpAddr, peer_as: u16, local_as: u16, router_id: Ipv4Addr) -> Self {
        Self {
            peer_address,
            port: BGP_PORT,
            peer_as,
            local_as,
            router_id,
            hold_time: 180,
            passive: false,
            graceful_restart: false,
            api: ApiOptions::default(),
            families: vec![Family::for_address(peer_address)],
            routes: Vec::new(),
        }
    }

    /// Render the announced routes, one UPDATE message per route so a large batch can cede to other peers between messages. IPv4 unicast
    /// routes travel in the classic NLRI field, everything else in an MP_REACH_NLRI attribute.
    pub fn updates(&self) -> Vec<UpdateMessage> {
        self.routes
            .iter()
            .map(|route| {
                let mut path_attributes = vec![
                    PathAttribute::Origin(Origin::IGP),
                    PathAttribute::AsPath(vec![ASPathSegment::Sequence(vec![self.local_as])]),
                ];

                match (route.prefix.address, route.next_hop) {
                    (IpAddr::V4(_), next_hop @ IpAddr::V4(_)) => {
                        path_attributes.push(PathAttribute::NextHop(next_hop));
                        UpdateMessage {
                            withdrawn_routes: Vec::new(),
                            path_attributes,
                            nlri: vec![route.prefix],
                        }
                    }
                    (address, next_hop) => {
                        let next_hop = match next_hop {
                            IpAddr::V4(addr) => addr.octets().to_vec(),
                            IpAddr::V6(addr) => addr.octets().to_vec(),
                        };
                        path_attributes.push(PathAttribute::MpReachNlri(MultiprotocolReachNLRI {
                            family: Family::for_address(address),
                            next_hop,
                            nlri: vec![route.prefix],
                        }));
                        UpdateMessage {
                            withdrawn_routes: Vec::new(),
                            path_attributes,
                            nlri: Vec::new(),
                        }
                    }
                }
            })
            .collect()
    }
}

impl Display for Neighbor {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "peer {} ASN {}", self.peer_address, self.peer_as)
    }
}
