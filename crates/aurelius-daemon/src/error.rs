use aurelius_bgp::rfc4271::NotificationMessage;
use std::{
    io,
    net::IpAddr,
};
use thiserror::Error;

/// This error is raised while binding the configured listen endpoints and is fatal to startup. The variants distinguish the two bind
/// failures an operator can act on directly from the rest.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("could not listen on {0}:{1}, the port is already in use by another application")]
    AddressInUse(IpAddr, u16),
    #[error("could not listen on {0}:{1}, this is an invalid address")]
    InvalidAddress(IpAddr, u16),
    #[error("could not listen on {0}:{1} => {2}")]
    Other(IpAddr, u16, io::Error),
}

/// This error is raised when accepting or pre-validating an incoming connection fails for a reason other than "would block". The reactor
/// logs it and may keep serving.
#[derive(Debug, Error)]
#[error("could not accept a new connection => {0}")]
pub struct AcceptError(#[from] pub io::Error);

/// A failure of the underlying TCP transport of one session direction.
#[derive(Debug, Error)]
#[error("connection issue => {0}")]
pub struct NetworkError(#[from] pub io::Error);

impl NetworkError {
    /// The peer closed the connection underneath us.
    pub fn closed() -> Self {
        NetworkError(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"))
    }
}

/// A failure of the out-of-process API helper this daemon bridges session events to.
#[derive(Debug, Error)]
#[error("process bridge failure => {0}")]
pub struct ProcessError(pub String);

/// A protocol violation detected on our side. Carries the notification this speaker owes the peer before closing the session.
#[derive(Debug, Error)]
#[error("notifying peer ({code},{subcode}) => {diagnostic}")]
pub struct Notify {
    pub code: u8,
    pub subcode: u8,
    pub diagnostic: String,
}

impl Notify {
    pub fn new(code: u8, subcode: u8, diagnostic: &str) -> Self {
        Self {
            code,
            subcode,
            diagnostic: diagnostic.into(),
        }
    }

    /// The wire message announcing this violation to the peer.
    pub fn message(&self) -> NotificationMessage {
        NotificationMessage::new(self.code, self.subcode, &self.diagnostic)
    }
}

/// Why one half-session ended before or instead of a clean close. The establishment and established steps return these as values instead
/// of unwinding; the peer's settle handler performs the close-and-reset bookkeeping for every variant in one place.
#[derive(Debug)]
pub enum SessionError {
    /// connect/read/write failed underneath the session
    Network(NetworkError),
    /// we detected a violation and owe the peer a notification
    Notify(Notify),
    /// the peer notified us of an error
    Notification(NotificationMessage),
    /// the out-of-process API helper failed
    Process(ProcessError),
    /// shutdown was observed at a suspension point, tear down quietly
    Interrupted,
}

impl From<NetworkError> for SessionError {
    fn from(error: NetworkError) -> Self {
        Self::Network(error)
    }
}

impl From<Notify> for SessionError {
    fn from(notify: Notify) -> Self {
        Self::Notify(notify)
    }
}

impl From<NotificationMessage> for SessionError {
    fn from(notification: NotificationMessage) -> Self {
        Self::Notification(notification)
    }
}

impl From<ProcessError> for SessionError {
    fn from(error: ProcessError) -> Self {
        Self::Process(error)
    }
}
