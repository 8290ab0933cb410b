use crate::{
    error::{
        NetworkError,
        Notify,
        SessionError,
    },
    listener::Incoming,
    neighbor::Neighbor,
};
use aurelius_bgp::{
    prefix::Family,
    rfc3392::Capability,
    rfc4271::{
        OpenMessage,
        UpdateMessage,
    },
    BGPElement,
    BGPMessage,
    HEADER_LEN,
    MARKER,
    MAX_MESSAGE_LEN,
};
use log::debug;
use std::{
    collections::VecDeque,
    fmt::{
        Display,
        Formatter,
    },
    io::{
        self,
        Read,
        Write,
    },
    net::{
        IpAddr,
        Shutdown,
        SocketAddr,
    },
    os::fd::{
        AsRawFd,
        RawFd,
    },
};
use mio::net::TcpStream;

/// Which side initiated the TCP connection this adapter owns.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Display for Direction {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::In => write!(formatter, "in"),
            Self::Out => write!(formatter, "out"),
        }
    }
}

/// The outcome of the OPEN exchange of one direction: both OPEN messages and, once validation concluded, the session hold time and the
/// address families both sides agreed to exchange.
#[derive(Debug, Default)]
pub struct Negotiated {
    pub sent: Option<OpenMessage>,
    pub received: Option<OpenMessage>,
    pub holdtime: u16,
    pub families: Vec<Family>,
}

fn multiprotocol_families(open: &OpenMessage) -> Vec<Family> {
    open.capabilities()
        .into_iter()
        .filter_map(|capability| {
            if let Capability::MultiprotocolExtensions(capability) = capability {
                Some(capability.family)
            } else {
                None
            }
        })
        .collect()
}

impl Negotiated {
    /// Whether our own OPEN announced the capability with the given code.
    pub fn announced(&self, code: u8) -> bool {
        self.sent.as_ref().map(|open| open.announced(code)).unwrap_or(false)
    }

    /// Run the post-handshake validation over the recorded OPEN pair: protocol version, the configured peer ASN, the hold-time policy of
    /// RFC 4271 (zero or at least three seconds) and the collision-resolution rule, then fix the negotiated hold time and family set.
    ///
    /// Collision resolution follows section 6.8 of RFC 4271: when both directions are in the middle of establishment, the connection
    /// initiated by the side with the higher BGP identifier survives. A direction whose opposite is already established always loses.
    pub fn validate(&mut self, direction: Direction, peer_as: u16, other_ahead: bool, other_established: bool) -> Result<(), Notify> {
        let received = self
            .received
            .as_ref()
            .ok_or(Notify::new(5, 0, "no OPEN message was recorded for validation"))?;

        if received.version != 4 {
            return Err(Notify::new(2, 1, "unsupported version number"));
        }
        if received.autonomous_system != peer_as {
            return Err(Notify::new(2, 2, "bad peer AS"));
        }
        if received.hold_time == 1 || received.hold_time == 2 {
            return Err(Notify::new(2, 6, "unacceptable hold time"));
        }

        if self.collision_loser(direction, other_ahead, other_established) {
            return Err(Notify::new(6, 7, "connection collision resolution"));
        }

        let (sent, received) = (self.sent.as_ref(), self.received.as_ref());
        self.holdtime = match (sent, received) {
            (Some(sent), Some(received)) => sent.hold_time.min(received.hold_time),
            _ => 0,
        };
        self.families = match (sent, received) {
            (Some(sent), Some(received)) => {
                let offered = multiprotocol_families(received);
                multiprotocol_families(sent)
                    .into_iter()
                    .filter(|family| offered.contains(family))
                    .collect()
            }
            _ => Vec::new(),
        };
        Ok(())
    }

    fn collision_loser(&self, direction: Direction, other_ahead: bool, other_established: bool) -> bool {
        if other_established {
            return true;
        }
        if !other_ahead {
            return false;
        }
        let (Some(sent), Some(received)) = (self.sent.as_ref(), self.received.as_ref()) else {
            return false;
        };
        match direction {
            // our outbound connection survives only if our identifier is the higher one
            Direction::Out => received.bgp_identifier >= sent.bgp_identifier,
            Direction::In => received.bgp_identifier < sent.bgp_identifier,
        }
    }
}

/// Per-connection encoder/decoder between one non-blocking socket and typed [BGPMessage] values. Every consuming operation is
/// poll-shaped: it returns `Ok(None)` while no complete message is buffered. Every producing operation enqueues into the write buffer,
/// which [Protocol::flush] pushes out as the socket accepts bytes.
pub struct Protocol {
    stream: TcpStream,
    pub direction: Direction,
    peer_address: IpAddr,
    read_buffer: Vec<u8>,
    write_buffer: VecDeque<u8>,
    pub negotiated: Negotiated,
    closed: bool,
}

impl Protocol {
    /// Adopt a connection the listener accepted, pre-loaded with the fully buffered OPEN the listener validated. The first
    /// [Protocol::next_message] call replays that OPEN without touching the socket.
    pub fn accept(incoming: Incoming) -> Self {
        Self {
            stream: incoming.stream,
            direction: Direction::In,
            peer_address: incoming.address,
            read_buffer: incoming.open,
            write_buffer: VecDeque::new(),
            negotiated: Negotiated::default(),
            closed: false,
        }
    }

    /// Initiate a non-blocking connection to the neighbor. The TCP handshake completes in the background; the first successful flush is
    /// the sign it went through, a later read or write error the sign it did not.
    pub fn connect(neighbor: &Neighbor) -> Result<Self, NetworkError> {
        let address = SocketAddr::new(neighbor.peer_address, neighbor.port);
        let stream = TcpStream::connect(address)?;
        Ok(Self {
            stream,
            direction: Direction::Out,
            peer_address: neighbor.peer_address,
            read_buffer: Vec::new(),
            write_buffer: VecDeque::new(),
            negotiated: Negotiated::default(),
            closed: false,
        })
    }

    /// Pull whatever the socket has into the read buffer. `Ok(false)` means the socket had nothing for us right now.
    fn fill(&mut self) -> Result<bool, NetworkError> {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(NetworkError::closed()),
            Ok(count) => {
                self.read_buffer.extend_from_slice(&chunk[..count]);
                Ok(true)
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(error) => Err(NetworkError::from(error)),
        }
    }

    /// Read zero or one message. `Ok(None)` is the "no complete message yet" token; a received NOTIFICATION surfaces as
    /// [SessionError::Notification] because it always ends the session of its direction.
    pub fn next_message(&mut self) -> Result<Option<BGPMessage>, SessionError> {
        if self.read_buffer.len() < HEADER_LEN as usize {
            self.fill().map_err(SessionError::Network)?;
        }
        if self.read_buffer.len() < HEADER_LEN as usize {
            return Ok(None);
        }

        if self.read_buffer[..16] != MARKER {
            return Err(Notify::new(1, 1, "the first 16 bytes of the message are not 0xFF").into());
        }
        let length = u16::from_be_bytes([self.read_buffer[16], self.read_buffer[17]]);
        let kind = self.read_buffer[18];
        if !(BGPMessage::OPEN..=BGPMessage::KEEPALIVE).contains(&kind) {
            return Err(Notify::new(1, 3, "unknown message type").into());
        }
        if length < BGPMessage::min_length(kind) || length > MAX_MESSAGE_LEN {
            return Err(Notify::new(1, 2, "invalid message length").into());
        }

        if self.read_buffer.len() < length as usize {
            self.fill().map_err(SessionError::Network)?;
            if self.read_buffer.len() < length as usize {
                return Ok(None);
            }
        }

        let frame: Vec<u8> = self.read_buffer.drain(..length as usize).collect();
        match BGPMessage::unpack(&frame) {
            Ok((_, BGPMessage::Notification(notification))) => Err(SessionError::Notification(notification)),
            Ok((_, message)) => Ok(Some(message)),
            Err(_) => {
                Err(match kind {
                    BGPMessage::OPEN => Notify::new(2, 0, "could not parse the OPEN message"),
                    BGPMessage::UPDATE => Notify::new(3, 0, "could not parse the UPDATE message"),
                    _ => Notify::new(1, 0, "could not parse the message"),
                }
                .into())
            }
        }
    }

    fn enqueue(&mut self, message: &BGPMessage) {
        self.write_buffer.extend(message.pack());
    }

    /// Push buffered bytes towards the peer. `Ok(true)` when the write buffer drained completely.
    pub fn flush(&mut self) -> Result<bool, NetworkError> {
        while !self.write_buffer.is_empty() {
            let (front, _) = self.write_buffer.as_slices();
            match self.stream.write(front) {
                Ok(0) => return Err(NetworkError::closed()),
                Ok(count) => {
                    self.write_buffer.drain(..count);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(NetworkError::from(error)),
            }
        }
        Ok(true)
    }

    /// Enqueue our OPEN and record it as the sent half of the negotiation.
    pub fn new_open(&mut self, open: OpenMessage) {
        self.enqueue(&BGPMessage::Open(open.clone()));
        self.negotiated.sent = Some(open);
    }

    pub fn new_keepalive(&mut self) {
        self.enqueue(&BGPMessage::KeepAlive);
    }

    /// Write a notification, best effort and synchronously: the session is over either way, so write errors are swallowed.
    pub fn new_notification(&mut self, notify: &Notify) {
        self.enqueue(&BGPMessage::Notification(notify.message()));
        let _ = self.flush();
    }

    /// The lazy End-of-RIB producer, one marker per negotiated family.
    pub fn new_eors(&self) -> UpdateBatch {
        UpdateBatch::new(self.negotiated.families.iter().map(|family| UpdateMessage::end_of_rib(*family)).collect())
    }

    /// Run the post-handshake validation for this direction; see [Negotiated::validate].
    pub fn validate_open(&mut self, peer_as: u16, other_ahead: bool, other_established: bool) -> Result<(), Notify> {
        self.negotiated.validate(self.direction, peer_as, other_ahead, other_established)
    }

    /// Close the underlying socket. Idempotent; every path that ends a session funnels through here exactly once per adapter.
    pub fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("closed {} connection with {} => {}", self.direction, self.peer_address, reason);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// The raw I/O handle for reactor-level readiness selection.
    pub fn descriptor(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// A lazy producer of UPDATE messages. One message is enqueued per advance so a large batch cedes to other peers between messages;
/// exhaustion means every message of the batch has been flushed out.
#[derive(Debug)]
pub struct UpdateBatch {
    queue: VecDeque<UpdateMessage>,
}

impl UpdateBatch {
    pub fn new(updates: Vec<UpdateMessage>) -> Self {
        Self { queue: updates.into() }
    }

    /// Advance the batch one step. `Ok(true)` once the last message left the write buffer.
    pub fn advance(&mut self, proto: &mut Protocol) -> Result<bool, NetworkError> {
        if !proto.flush()? {
            return Ok(false);
        }
        match self.queue.pop_front() {
            Some(update) => {
                proto.enqueue(&BGPMessage::Update(update));
                proto.flush()?;
                Ok(false)
            }
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Direction,
        Negotiated,
    };
    use aurelius_bgp::{
        prefix::Family,
        rfc3392::Capability,
        rfc4271::{
            OpenMessage,
            OptionalParameter,
        },
        rfc4760::MultiprotocolExtensionsCapability,
    };

    fn open(identifier: u32, hold_time: u16, families: &[Family]) -> OpenMessage {
        OpenMessage {
            version: 4,
            autonomous_system: 65002,
            hold_time,
            bgp_identifier: identifier,
            optional_parameters: vec![OptionalParameter::Capabilities(
                families
                    .iter()
                    .map(|family| Capability::MultiprotocolExtensions(MultiprotocolExtensionsCapability { family: *family }))
                    .collect(),
            )],
        }
    }

    fn negotiated(local_id: u32, remote_id: u32) -> Negotiated {
        Negotiated {
            sent: Some(open(local_id, 180, &[Family::IPV4_UNICAST, Family::IPV6_UNICAST])),
            received: Some(open(remote_id, 90, &[Family::IPV4_UNICAST])),
            holdtime: 0,
            families: Vec::new(),
        }
    }

    #[test]
    fn test_holdtime_and_family_intersection() {
        let mut negotiated = negotiated(1, 2);
        negotiated.validate(Direction::Out, 65002, false, false).unwrap();
        assert_eq!(negotiated.holdtime, 90);
        assert_eq!(negotiated.families, vec![Family::IPV4_UNICAST]);
    }

    #[test]
    fn test_version_and_asn_checks() {
        let mut negotiated = negotiated(1, 2);
        negotiated.received.as_mut().unwrap().version = 3;
        let error = negotiated.validate(Direction::Out, 65002, false, false).unwrap_err();
        assert_eq!((error.code, error.subcode), (2, 1));

        let mut negotiated = self::negotiated(1, 2);
        let error = negotiated.validate(Direction::Out, 64999, false, false).unwrap_err();
        assert_eq!((error.code, error.subcode), (2, 2));
    }

    #[test]
    fn test_holdtime_policy() {
        let mut negotiated = negotiated(1, 2);
        negotiated.received.as_mut().unwrap().hold_time = 2;
        let error = negotiated.validate(Direction::Out, 65002, false, false).unwrap_err();
        assert_eq!((error.code, error.subcode), (2, 6));
    }

    #[test]
    fn test_collision_prefers_the_higher_identifier() {
        // our identifier is lower, so our outbound connection loses against the racing inbound one
        let mut lower = negotiated(1, 2);
        let error = lower.validate(Direction::Out, 65002, true, false).unwrap_err();
        assert_eq!((error.code, error.subcode), (6, 7));

        // with the higher identifier our outbound connection survives the race
        let mut higher = negotiated(2, 1);
        assert!(higher.validate(Direction::Out, 65002, true, false).is_ok());

        // and the mirrored inbound direction of the same race loses
        let mut inbound = negotiated(2, 1);
        let error = inbound.validate(Direction::In, 65002, true, false).unwrap_err();
        assert_eq!((error.code, error.subcode), (6, 7));
    }

    #[test]
    fn test_established_opposite_always_wins() {
        let mut negotiated = negotiated(2, 1);
        let error = negotiated.validate(Direction::Out, 65002, true, true).unwrap_err();
        assert_eq!((error.code, error.subcode), (6, 7));
    }
}
