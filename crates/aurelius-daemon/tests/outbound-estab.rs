//! Drives a full outbound establishment against a scripted remote speaker, then tears the session down with an armed cease subcode and
//! checks the notification that leaves the wire.

use aurelius_bgp::{
    rfc4271::OpenMessage,
    BGPElement,
    BGPMessage,
};
use aurelius_daemon::{
    env::Environment,
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
        TcpListener,
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
fn outbound_establishment_and_armed_teardown() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let remote = thread::spawn(move || -> Vec<(u8, Vec<u8>)> {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        // the peer speaks first on an outbound session
        let (kind, _) = read_message(&mut stream).expect("expected the peer's OPEN");
        assert_eq!(kind, BGPMessage::OPEN);

        stream.write_all(&remote_open()).unwrap();
        stream.write_all(&BGPMessage::KeepAlive.pack()).unwrap();

        // record everything the peer sends until its notification arrives
        let mut seen = Vec::new();
        while let Some((kind, body)) = read_message(&mut stream) {
            let done = kind == BGPMessage::NOTIFICATION;
            seen.push((kind, body));
            if done {
                break;
            }
        }
        seen
    });

    let mut neighbor = Neighbor::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 65002, 65001, Ipv4Addr::new(10, 0, 0, 1));
    neighbor.port = port;

    let bridge: SharedBridge = Rc::new(RefCell::new(NullBridge));
    let mut peer = Peer::new(neighbor, &Environment::default(), bridge);

    for _ in 0..1000 {
        peer.step();
        if peer.session_states().1 == SessionState::Established {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(peer.session_states(), (SessionState::Idle, SessionState::Established));

    // an armed teardown raises a cease with the given subcode out of the established loop
    peer.teardown(2, false);
    for _ in 0..1000 {
        if peer.step() == Intent::Done {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(peer.step(), Intent::Done);

    let seen = remote.join().unwrap();
    let (kind, body) = seen.last().expect("the remote saw no messages at all");
    assert_eq!(*kind, BGPMessage::NOTIFICATION);
    assert_eq!(&body[..2], &[6, 2]);

    // everything before the notification was keepalive traffic
    assert!(seen[..seen.len() - 1].iter().all(|(kind, _)| *kind == BGPMessage::KEEPALIVE));
}
