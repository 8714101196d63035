//! Interest records tracked by the event loop.
//!
//! Every monitored descriptor has exactly one record. Records live in a
//! slab owned by the loop; the slot index doubles as the mio `Token` the
//! notifier reports back, so lookups on dispatch are O(1).

use crate::runtime::connection::ConnectionState;
use crate::runtime::listener::ListenerState;
use mio::event::Event;
use mio::Interest;
use std::ops::BitOr;
use std::os::unix::io::RawFd;

/// Readiness conditions a record waits for, or that an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask {
    readable: bool,
    writable: bool,
}

impl EventMask {
    pub const READ: EventMask = EventMask {
        readable: true,
        writable: false,
    };

    #[allow(dead_code)] // no handler in this server waits for writability
    pub const WRITE: EventMask = EventMask {
        readable: false,
        writable: true,
    };

    pub fn is_readable(self) -> bool {
        self.readable
    }

    pub fn is_writable(self) -> bool {
        self.writable
    }

    #[cfg(test)]
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    /// Notifier interest for this mask, or `None` when the mask is empty.
    pub(crate) fn to_interest(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Readiness reported by a notifier event.
    ///
    /// Hang-ups and socket errors count as readable: the next read on the
    /// descriptor surfaces them as EOF or an error.
    pub(crate) fn from_event(event: &Event) -> Self {
        EventMask {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask {
            readable: self.readable || rhs.readable,
            writable: self.writable || rhs.writable,
        }
    }
}

/// Callback the loop dispatches to when a record's descriptor is ready.
///
/// Each variant owns the context it runs against, so dropping the handler
/// releases the context and closes its descriptor.
#[derive(Debug)]
pub enum Handler {
    /// Connection manager: accepts one pending client per invocation.
    Accept(ListenerState),
    /// Echo handler: one read and one echo write per invocation.
    Read(ConnectionState),
}

/// What a callback asks of the loop once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the record armed.
    Keep,
    /// Deregister the record and release its context.
    Close,
}

/// One registration in the event loop.
#[derive(Debug)]
pub struct InterestRecord {
    pub(crate) fd: RawFd,
    pub(crate) mask: EventMask,
    pub(crate) persistent: bool,
    /// `None` only while the handler is out running its callback.
    pub(crate) handler: Option<Handler>,
}

#[cfg(test)]
impl InterestRecord {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn mask(&self) -> EventMask {
        self.mask
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}
