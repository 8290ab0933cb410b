use crate::error::ProcessError;
use std::{
    cell::RefCell,
    net::IpAddr,
    rc::Rc,
};

/// This trait is the contract to the out-of-process API that feeds route advertisements into the daemon and consumes session events. The
/// reactor is single-threaded and cooperative, so the bridge is shared without locking.
pub trait ProcessBridge {
    /// Whether the helper process responsible for this neighbor is gone. A broken helper stops the peer instead of establishing a session
    /// nobody would feed.
    fn broken(&self, peer: IpAddr) -> bool;

    /// Announce the session with this neighbor as established.
    fn up(&mut self, peer: IpAddr) -> Result<(), ProcessError>;
}

/// The bridge for deployments without a helper process: nothing is ever broken and session events are swallowed.
#[derive(Debug, Default)]
pub struct NullBridge;

impl ProcessBridge for NullBridge {
    fn broken(&self, _peer: IpAddr) -> bool {
        false
    }

    fn up(&mut self, _peer: IpAddr) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// The bridge handle every peer holds. All peers of one reactor share the same bridge.
pub type SharedBridge = Rc<RefCell<dyn ProcessBridge>>;
