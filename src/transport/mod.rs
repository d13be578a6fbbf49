//! Abstract command-channel interface.
//!
//! The programmer session consumes command frames and produces response
//! frames; how those frames travel is the transport's business. The shipped
//! implementation speaks single-connection HTTP, but anything that can hand
//! over one request body at a time fits.

use anyhow::Result;

pub use self::http::HttpTransport;

mod http;

/// One end of the command channel, polled by the programmer's state
/// machine. All methods are non-blocking.
pub trait CommandTransport {
    /// A new client is waiting to start a session.
    fn session_waiting(&mut self) -> bool;

    /// Adopt the waiting client as the current session.
    fn open_session(&mut self) -> Result<()>;

    /// The current session is still connected.
    fn session_alive(&mut self) -> bool;

    /// Drop the current session, if any.
    fn close_session(&mut self);

    /// Refuse and close every other client trying to connect. The device
    /// bus has a single owner; latecomers are turned away, not queued.
    fn reject_incoming(&mut self);

    /// The next complete command frame, if one has arrived.
    fn receive_body(&mut self) -> Result<Option<Vec<u8>>>;

    /// Transmit one response frame, verbatim, to the current session.
    fn send(&mut self, body: &[u8]) -> Result<()>;
}
