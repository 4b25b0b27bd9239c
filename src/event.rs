/// Events delivered to connection callbacks.
///
/// Every event arrives with a payload buffer; events without a payload carry
/// an empty one. For [`Event::Error`] the payload is human-readable text
/// describing the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A listener socket is bound and receiving.
    Listening,
    /// A remote endpoint was observed for the first time.
    ConnectionReady,
    /// The remote endpoint sent a close frame.
    ConnectionClosed,
    /// The connection was torn down after a fatal socket error.
    ConnectionLost,
    /// A one-way message arrived.
    Message,
    /// A request arrived; answer it with [`crate::Postbox::reply`].
    Request,
    /// A reply arrived.
    Reply,
    /// Something went wrong; the payload holds the error text.
    Error,
}
