//! Drives the inbound path end to end: the listener pre-validates a remote OPEN, the peer adopts the connection and establishes the
//! session, and a stop on a graceful-restart session closes silently without any notification.

use aurelius_bgp::{
    rfc4271::OpenMessage,
    BGPElement,
    BGPMessage,
};
use aurelius_daemon::{
    env::Environment,
    listener::Listener,
    neighbor::Neighbor,
    peer::{
        Intent,
        Peer,
        SessionState,
    },
    process::{
        NullBridge,
        SharedBridge,
    },
};
use std::{
    cell::RefCell,
    io::{
        Read,
        Write,
    },
    net::{
        IpAddr,
        Ipv4Addr,
        TcpStream,
    },
    rc::Rc,
    thread,
    time::Duration,
};

fn read_message(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 19];
    stream.read_exact(&mut header).ok()?;
    let length = u16::from_be_bytes([header[16], header[17]]) as usize;
    let mut body = vec![0u8; length - 19];
    stream.read_exact(&mut body).ok()?;
    Some((header[18], body))
}

fn remote_open() -> Vec<u8> {
    BGPMessage::Open(OpenMessage {
        version: 4,
        autonomous_system: 65002,
        hold_time: 180,
        bgp_identifier: 0x0A000002,
        optional_parameters: Vec::new(),
    })
    .pack()
}

#[test]
fn inbound_establishment_and_graceful_restart_silent_close() {
    let mut listener = Listener::new();
    listener.start(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], 0, 10).unwrap();
    let address = listener.local_addrs()[0];

    let remote = thread::spawn(move || -> Vec<u8> {
        let mut stream = TcpStream::connect(address).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(&remote_open()).unwrap();

        // the listener answers with its farewell notification before the hand-off, then the peer's own OPEN and KEEPALIVE follow
        let mut handshake = Vec::new();
        while !(handshake.contains(&BGPMessage::OPEN) && handshake.contains(&BGPMessage::KEEPALIVE)) {
            let (kind, _) = read_message(&mut stream).expect("handshake ended early");
            handshake.push(kind);
        }
        stream.write_all(&BGPMessage::KeepAlive.pack()).unwrap();

        // record everything after establishment until the peer goes away
        let mut after = Vec::new();
        while let Some((kind, _)) = read_message(&mut stream) {
            after.push(kind);
        }
        after
    });

    // pump the listener until the buffered OPEN is handed upward
    let mut completed = Vec::new();
    for _ in 0..1000 {
        completed.extend(listener.connections().unwrap());
        if !completed.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let incoming = completed.pop().expect("the listener never yielded the OPEN");
    assert_eq!(incoming.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(incoming.open.len(), 29);

    let mut neighbor = Neighbor::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 65002, 65001, Ipv4Addr::new(10, 0, 0, 1));
    neighbor.passive = true;
    neighbor.graceful_restart = true;

    let bridge: SharedBridge = Rc::new(RefCell::new(NullBridge));
    let mut peer = Peer::new(neighbor, &Environment::default(), bridge);
    assert!(peer.incoming(incoming));

    for _ in 0..1000 {
        peer.step();
        if peer.session_states().0 == SessionState::Established {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(peer.session_states(), (SessionState::Established, SessionState::Idle));

    // a graceful-restart session winds down without a notification on the wire
    peer.stop();
    for _ in 0..1000 {
        if peer.step() == Intent::Done {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(peer.step(), Intent::Done);

    let after = remote.join().unwrap();
    assert!(
        !after.contains(&BGPMessage::NOTIFICATION),
        "silent close must not put a notification on the wire, saw {:?}",
        after
    );
}
