use std::fmt;
use std::io;
use std::result::Result as StdResult;

use crate::conn::ConnectionId;

pub type Result<T> = StdResult<T, PostboxError>;

#[derive(Debug)]
pub enum PostboxError {
    /// Address string did not match `(udp|tcp)://(*|a.b.c.d):port`.
    Address(String),
    Io(io::Error),
    Bind(io::Error),
    Connect(io::Error),
    Recv(io::Error),
    Send(io::Error),
    UnsupportedTransport(String),
    ClosedConnection(ConnectionId),
    UnknownConnection(ConnectionId),
}

impl fmt::Display for PostboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostboxError::Address(msg) => write!(f, "{}", msg),
            PostboxError::Io(e) => write!(f, "io: {}", e),
            PostboxError::Bind(e) => write!(f, "bind: {}", e),
            PostboxError::Connect(e) => write!(f, "connect: {}", e),
            PostboxError::Recv(e) => write!(f, "recvfrom: {}", e),
            PostboxError::Send(e) => write!(f, "send: {}", e),
            PostboxError::UnsupportedTransport(addr) => {
                write!(f, "stream transport is not supported: {}", addr)
            }
            PostboxError::ClosedConnection(id) => {
                write!(f, "connection {} is closed", id.as_u64())
            }
            PostboxError::UnknownConnection(id) => {
                write!(f, "no such connection: {}", id.as_u64())
            }
        }
    }
}

impl std::error::Error for PostboxError {}

impl From<io::Error> for PostboxError {
    fn from(err: io::Error) -> Self {
        PostboxError::Io(err)
    }
}
