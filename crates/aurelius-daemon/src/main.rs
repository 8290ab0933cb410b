use anyhow::Context;
use aurelius_daemon::{
    env::Environment,
    neighbor::Neighbor,
    process::NullBridge,
    reactor::Reactor,
    BGP_PORT,
};
use log::{
    info,
    LevelFilter,
};
use simple_logger::SimpleLogger;
use std::{
    cell::RefCell,
    net::{
        IpAddr,
        Ipv4Addr,
    },
    process::exit,
    rc::Rc,
};

fn main() -> anyhow::Result<()> {
    if let Err(error) = SimpleLogger::new().with_level(LevelFilter::Info).init() {
        println!("Unable to initialize logging => {}", error);
        exit(-1);
    }

    let mut arguments = std::env::args().skip(1);
    let local_as: u16 = arguments
        .next()
        .context("Usage: aurelius <local-asn> <router-id> [<peer-address>=<peer-asn>...]")?
        .parse()
        .context("the local ASN is not a number")?;
    let router_id: Ipv4Addr = arguments
        .next()
        .context("missing router id")?
        .parse()
        .context("the router id is not an IPv4 address")?;

    let bridge: aurelius_daemon::process::SharedBridge = Rc::new(RefCell::new(NullBridge));
    let mut reactor = Reactor::new(Environment::default(), bridge)?;

    let mut configured = 0usize;
    for specification in arguments {
        let (address, peer_as) = specification
            .split_once('=')
            .context("expected a peer as <address>=<asn>")?;
        let neighbor = Neighbor::new(
            address.parse().context("the peer address is not an IP address")?,
            peer_as.parse().context("the peer ASN is not a number")?,
            local_as,
            router_id,
        );
        reactor.add_neighbor(neighbor);
        configured += 1;
    }

    reactor.listen(&[IpAddr::V4(Ipv4Addr::UNSPECIFIED)], BGP_PORT, 200)?;
    info!("starting reactor with {} configured neighbors", configured);
    reactor.run()?;
    Ok(())
}
