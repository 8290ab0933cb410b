use crate::error::{
    AcceptError,
    BindingError,
};
use aurelius_bgp::{
    rfc4271::NotificationMessage,
    BGPElement,
    BGPMessage,
    MARKER,
    MIN_OPEN_LEN,
};
use log::{
    debug,
    error,
};
use mio::net::{
    TcpListener,
    TcpStream,
};
use mio::{
    Interest,
    Registry,
    Token,
};
use socket2::{
    Domain,
    Socket,
    Type,
};
use std::{
    io::{
        self,
        Read,
        Write,
    },
    net::{
        IpAddr,
        SocketAddr,
    },
    time::{
        Duration,
        Instant,
    },
};

/// How long an accepted connection may take to deliver its complete OPEN before we drop it.
const MAX_OPEN_WAIT: Duration = Duration::from_secs(10);

/// The fixed BGP message header size in bytes.
const HEADER_LEN: usize = 19;

const OPEN_BYE: &str = "we do not accept incoming connection - thanks for calling";
const OPEN_INVALID_HEADER: &str = "invalid OPEN message (16 first bytes are not 0xFF)";
const OPEN_INVALID_TYPE: &str = "invalid OPEN message (it is not an OPEN message)";
const OPEN_INVALID_SIZE: &str = "invalid OPEN message (invalid size in message)";

/// A fully buffered, structurally plausible OPEN together with its socket. Yielding one of these transfers ownership of the socket to the
/// consumer; the listener keeps nothing behind.
pub struct Incoming {
    pub stream: TcpStream,
    pub open: Vec<u8>,
    pub address: IpAddr,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Stage {
    Header,
    Body,
}

/// One accepted-but-unvalidated connection, re-entered on every scheduler tick until its OPEN is complete or it is dropped.
struct PendingOpen {
    stream: TcpStream,
    since: Instant,
    address: IpAddr,
    stage: Stage,
    to_read: usize,
    received: Vec<u8>,
}

enum Verdict {
    Keep,
    Drop,
    Complete,
}

/// Owns the listening endpoints of the daemon, accepts inbound connections and pre-validates their OPEN header so the peer layer only
/// ever sees a fully buffered, structurally plausible OPEN message.
pub struct Listener {
    sockets: Vec<(TcpListener, SocketAddr)>,
    pending: Vec<PendingOpen>,
    serving: bool,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    pub fn new() -> Self {
        Self {
            sockets: Vec::new(),
            pending: Vec::new(),
            serving: false,
        }
    }

    fn bind(host: IpAddr, port: u16, backlog: i32) -> Result<TcpListener, BindingError> {
        let address = SocketAddr::new(host, port);
        let map = |error: io::Error| {
            match error.kind() {
                io::ErrorKind::AddrInUse => BindingError::AddressInUse(host, port),
                io::ErrorKind::AddrNotAvailable => BindingError::InvalidAddress(host, port),
                _ => BindingError::Other(host, port, error),
            }
        };

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(socket2::Protocol::TCP)).map_err(map)?;
        if address.is_ipv6() {
            let _ = socket.set_only_v6(true);
        }

        // address reuse is best effort
        let _ = socket.set_reuse_address(true);
        socket.set_nonblocking(true).map_err(map)?;
        socket.bind(&address.into()).map_err(map)?;
        socket.listen(backlog).map_err(map)?;
        debug!("TCP listener is listening on {}", address);
        Ok(TcpListener::from_std(socket.into()))
    }

    /// Bind and listen on every given host with the shared port. Fails on the first endpoint that cannot be bound; already-bound
    /// endpoints from an earlier call are kept as they are.
    pub fn start(&mut self, hosts: &[IpAddr], port: u16, backlog: i32) -> Result<(), BindingError> {
        for host in hosts {
            if self.sockets.iter().any(|(_, bound)| bound.ip() == *host && bound.port() == port) {
                continue;
            }
            match Self::bind(*host, port, backlog) {
                Ok(socket) => {
                    let local = socket.local_addr().unwrap_or(SocketAddr::new(*host, port));
                    self.sockets.push((socket, local));
                }
                Err(binding_error) => {
                    error!("{}", binding_error);
                    return Err(binding_error);
                }
            }
        }
        self.serving = true;
        Ok(())
    }

    /// Close every listening socket. Idempotent when not serving; pending half-read connections are dropped as well.
    pub fn stop(&mut self) {
        if !self.serving {
            return;
        }
        for (_, address) in &self.sockets {
            error!("stop listening on {}", address);
        }
        self.sockets.clear();
        self.pending.clear();
        self.serving = false;
    }

    /// The addresses this listener is actually bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().map(|(_, address)| *address).collect()
    }

    /// Register every listening socket for readiness selection. Tokens count up from `base`.
    pub fn register(&mut self, registry: &Registry, base: Token) -> io::Result<()> {
        for (index, (socket, _)) in self.sockets.iter_mut().enumerate() {
            registry.register(socket, Token(base.0 + index), Interest::READABLE)?;
        }
        Ok(())
    }

    /// The central lazy producer: accept fresh connections, advance every pending OPEN by at most one read, and hand every completed OPEN
    /// upward. Would-block conditions leave entries untouched for the next tick.
    pub fn connections(&mut self) -> Result<Vec<Incoming>, AcceptError> {
        self.poll_connections(Instant::now())
    }

    fn poll_connections(&mut self, now: Instant) -> Result<Vec<Incoming>, AcceptError> {
        if !self.serving {
            return Ok(Vec::new());
        }

        // one fresh accept per tick keeps the accept path fair against the per-connection read work
        'accept: for (socket, _) in &self.sockets {
            match socket.accept() {
                Ok((stream, address)) => {
                    debug!("accepted connection from {}", address);
                    self.pending.push(PendingOpen {
                        stream,
                        since: now,
                        address: address.ip(),
                        stage: Stage::Header,
                        to_read: HEADER_LEN,
                        received: Vec::with_capacity(MIN_OPEN_LEN as usize),
                    });
                    break 'accept;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => continue,
                Err(error) => {
                    let accept_error = AcceptError(error);
                    error!("{}", accept_error);
                    return Err(accept_error);
                }
            }
        }

        let mut completed = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            match Self::pump(&mut self.pending[index], now) {
                Ok(Verdict::Keep) => index += 1,
                Ok(Verdict::Drop) => {
                    self.pending.remove(index);
                }
                Ok(Verdict::Complete) => {
                    let entry = self.pending.remove(index);
                    completed.push(Incoming {
                        stream: entry.stream,
                        open: entry.received,
                        address: entry.address,
                    });
                }
                Err(error) => {
                    self.pending.remove(index);
                    let accept_error = AcceptError(error);
                    error!("{}", accept_error);
                    return Err(accept_error);
                }
            }
        }
        Ok(completed)
    }

    /// Advance one pending connection by at most one read, then run its stage machine.
    fn pump(entry: &mut PendingOpen, now: Instant) -> io::Result<Verdict> {
        let mut chunk = [0u8; 4096];
        let wanted = entry.to_read.min(chunk.len());
        match entry.stream.read(&mut chunk[..wanted]) {
            // the peer went away before delivering a complete OPEN
            Ok(0) => return Ok(Verdict::Drop),
            Ok(count) => {
                entry.received.extend_from_slice(&chunk[..count]);
                entry.to_read -= count;
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }

        if now.duration_since(entry.since) > MAX_OPEN_WAIT {
            debug!("dropping connection from {}, waited too long for its OPEN", entry.address);
            return Ok(Verdict::Drop);
        }

        if entry.to_read > 0 {
            return Ok(Verdict::Keep);
        }

        match entry.stage {
            Stage::Header => {
                if entry.received[..16] != MARKER {
                    Self::reply(&mut entry.stream, OPEN_INVALID_HEADER);
                    return Ok(Verdict::Drop);
                }
                if entry.received[18] != BGPMessage::OPEN {
                    Self::reply(&mut entry.stream, OPEN_INVALID_TYPE);
                    return Ok(Verdict::Drop);
                }
                // the length field is read from the accumulated buffer, not from the most recent chunk
                let size = u16::from_be_bytes([entry.received[16], entry.received[17]]);
                if size < MIN_OPEN_LEN {
                    Self::reply(&mut entry.stream, OPEN_INVALID_SIZE);
                    return Ok(Verdict::Drop);
                }
                entry.stage = Stage::Body;
                entry.to_read = size as usize - HEADER_LEN;
                Ok(Verdict::Keep)
            }
            Stage::Body => {
                // the minimal valid farewell in case no peer claims this connection
                Self::reply(&mut entry.stream, OPEN_BYE);
                Ok(Verdict::Complete)
            }
        }
    }

    fn reply(stream: &mut TcpStream, diagnostic: &str) {
        let message = BGPMessage::Notification(NotificationMessage::new(2, 0, diagnostic)).pack();
        let _ = stream.write(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Listener,
        MAX_OPEN_WAIT,
    };
    use aurelius_bgp::{
        rfc4271::OpenMessage,
        BGPElement,
        BGPMessage,
    };
    use std::{
        io::{
            Read,
            Write,
        },
        net::{
            IpAddr,
            Ipv4Addr,
            TcpStream,
        },
        thread::sleep,
        time::{
            Duration,
            Instant,
        },
    };

    fn serving_listener() -> (Listener, std::net::SocketAddr) {
        let mut listener = Listener::new();
        listener.start(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], 0, 10).unwrap();
        let address = listener.local_addrs()[0];
        (listener, address)
    }

    fn valid_open() -> Vec<u8> {
        BGPMessage::Open(OpenMessage {
            version: 4,
            autonomous_system: 65002,
            hold_time: 180,
            bgp_identifier: 0x0A000002,
            optional_parameters: Vec::new(),
        })
        .pack()
    }

    fn pump_until<F: FnMut(&mut Listener) -> bool>(listener: &mut Listener, mut done: F) {
        for _ in 0..400 {
            if done(listener) {
                return;
            }
            sleep(Duration::from_millis(5));
        }
        panic!("listener did not reach the expected state in time");
    }

    #[test]
    fn test_valid_open_is_handed_upward() {
        let (mut listener, address) = serving_listener();
        let mut client = TcpStream::connect(address).unwrap();

        // one byte per tick, the way a slow peer would trickle it in
        let open = valid_open();
        assert_eq!(open.len(), 29);
        let mut events = Vec::new();
        for byte in &open {
            client.write_all(&[*byte]).unwrap();
            events.extend(listener.connections().unwrap());
            sleep(Duration::from_millis(2));
        }
        pump_until(&mut listener, |listener| {
            events.extend(listener.connections().unwrap());
            !events.is_empty()
        });

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].open, open);
        assert_eq!(events[0].address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(listener.pending.is_empty());

        // the farewell notification reached the wire before the hand-off
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut reply = [0u8; 512];
        let count = client.read(&mut reply).unwrap();
        assert!(count >= 21);
        assert_eq!(reply[18], BGPMessage::NOTIFICATION);
        assert_eq!(&reply[19..21], &[2, 0]);
    }

    #[test]
    fn test_bad_marker_is_refused() {
        let (mut listener, address) = serving_listener();
        let mut client = TcpStream::connect(address).unwrap();

        let mut open = valid_open();
        open[0] = 0xFE;
        client.write_all(&open).unwrap();

        // no upstream event may emerge from a broken marker
        for _ in 0..100 {
            assert!(listener.connections().unwrap().is_empty());
            sleep(Duration::from_millis(5));
        }
        assert!(listener.pending.is_empty());

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut reply = [0u8; 512];
        let count = client.read(&mut reply).unwrap();
        assert!(count >= 21);
        assert_eq!(reply[18], BGPMessage::NOTIFICATION);
        assert_eq!(&reply[19..21], &[2, 0]);
        assert!(String::from_utf8_lossy(&reply[21..count]).contains("0xFF"));
    }

    #[test]
    fn test_wrong_type_is_refused() {
        let (mut listener, address) = serving_listener();
        let mut client = TcpStream::connect(address).unwrap();

        // a KEEPALIVE instead of the expected OPEN
        client.write_all(&BGPMessage::KeepAlive.pack()).unwrap();

        for _ in 0..100 {
            assert!(listener.connections().unwrap().is_empty());
            sleep(Duration::from_millis(5));
        }
        assert!(listener.pending.is_empty());

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut reply = [0u8; 512];
        let count = client.read(&mut reply).unwrap();
        assert!(count >= 21);
        assert_eq!(reply[18], BGPMessage::NOTIFICATION);
        assert_eq!(&reply[19..21], &[2, 0]);
    }

    #[test]
    fn test_stalled_open_times_out() {
        let (mut listener, address) = serving_listener();
        let mut client = TcpStream::connect(address).unwrap();
        client.write_all(&valid_open()[..10]).unwrap();

        // let the listener accept and buffer the partial header
        pump_until(&mut listener, |listener| {
            assert!(listener.connections().unwrap().is_empty());
            !listener.pending.is_empty()
        });

        // past the open-wait budget the entry is dropped without an upstream event
        let late = Instant::now() + MAX_OPEN_WAIT + Duration::from_secs(1);
        assert!(listener.poll_connections(late).unwrap().is_empty());
        assert!(listener.pending.is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut listener, _) = serving_listener();
        listener.stop();
        assert!(listener.local_addrs().is_empty());
        listener.stop();
        assert!(listener.connections().unwrap().is_empty());
    }
}
