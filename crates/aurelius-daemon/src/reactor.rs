use crate::{
    env::Environment,
    error::BindingError,
    listener::Listener,
    neighbor::Neighbor,
    peer::{
        Intent,
        Peer,
    },
    process::SharedBridge,
};
use log::{
    debug,
    error,
    info,
};
use mio::{
    Events,
    Poll,
    Token,
};
use std::{
    collections::HashMap,
    io,
    net::IpAddr,
    time::Duration,
};

/// How long an idle tick sleeps on the poll before pumping everything again.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// The single-threaded scheduler owning the listener and every configured peer. One thread round-robins over all of them: pump the
/// listener for completed OPEN messages, offer each to the peer owning its source address, then step every peer once. While any peer
/// reports urgent work the next tick follows immediately; otherwise the reactor parks on its poll until a socket becomes ready or the
/// idle tick elapses.
pub struct Reactor {
    environment: Environment,
    listener: Listener,
    peers: HashMap<IpAddr, Peer>,
    bridge: SharedBridge,
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new(environment: Environment, bridge: SharedBridge) -> io::Result<Self> {
        Ok(Self {
            environment,
            listener: Listener::new(),
            peers: HashMap::new(),
            bridge,
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
        })
    }

    /// Register a peer for the neighbor definition. An existing peer for the same address is replaced.
    pub fn add_neighbor(&mut self, neighbor: Neighbor) {
        let address = neighbor.peer_address;
        let peer = Peer::new(neighbor, &self.environment, self.bridge.clone());
        if self.peers.insert(address, peer).is_some() {
            debug!("replaced the existing peer for {}", address);
        }
    }

    /// Bind the listening endpoints and register them for readiness selection.
    pub fn listen(&mut self, hosts: &[IpAddr], port: u16, backlog: i32) -> Result<(), BindingError> {
        self.listener.start(hosts, port, backlog)?;
        if let Err(error) = self.listener.register(self.poll.registry(), Token(0)) {
            error!("Unable to register listener into event polling => {}", error);
        }
        Ok(())
    }

    /// One full round over listener and peers. Reports whether any peer asked to be scheduled again immediately.
    pub fn tick(&mut self) -> bool {
        match self.listener.connections() {
            Ok(completed) => {
                for incoming in completed {
                    let address = incoming.address;
                    match self.peers.get_mut(&address) {
                        // a refused offer drops the connection
                        Some(peer) => {
                            peer.incoming(incoming);
                        }
                        None => debug!("no neighbor is configured for {}, dropping the connection", address),
                    }
                }
            }
            // the listener already logged it; the reactor keeps serving
            Err(_) => {}
        }

        let mut urgent = false;
        let mut finished = Vec::new();
        for (address, peer) in self.peers.iter_mut() {
            match peer.step() {
                Intent::Urgent => urgent = true,
                Intent::Idle => {}
                Intent::Done => finished.push(*address),
            }
        }
        for address in finished {
            self.peers.remove(&address);
            info!("peer {} unregistered", address);
        }
        urgent
    }

    /// Run until interrupted from outside. All scheduling happens in `tick`; the poll only decides how long to sleep between rounds.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            let urgent = self.tick();
            let timeout = if urgent { Duration::ZERO } else { IDLE_TICK };
            self.poll.poll(&mut self.events, Some(timeout))?;
        }
    }
}
