//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when descriptors are ready, then
//! the loop hands each ready descriptor to the callback registered for it.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Level-triggered persistence
//!
//! mio reports readiness edge-triggered. After a persistent record's
//! callback returns, the loop re-arms the descriptor with `reregister`,
//! which makes the notifier report it again on the next poll if it is
//! still ready. A listener with a backlog, or a socket with unread bytes,
//! therefore fires once per cycle until drained.

use crate::runtime::interest::{EventMask, Handler, InterestRecord, Verdict};
use crate::runtime::{connection, listener};
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Faults raised by the event loop.
///
/// Notifier faults are fatal to `run()`. Registration-contract violations
/// are returned to the caller that broke the contract.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("failed to create readiness notifier: {0}")]
    Create(#[source] io::Error),
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to arm fd {fd}: {source}")]
    Arm { fd: RawFd, source: io::Error },
    #[error("failed to disarm fd {fd}: {source}")]
    Disarm { fd: RawFd, source: io::Error },
    #[error("fd {fd} already has a registered interest")]
    AlreadyRegistered { fd: RawFd },
    #[error("no interest registered under token {0:?}")]
    NotRegistered(Token),
    #[error("interest for fd {fd} has an empty event mask")]
    EmptyMask { fd: RawFd },
}

/// Single-threaded dispatch loop and owner of every interest record.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    /// Ready tokens collected from `events` before dispatch.
    pending: Vec<(Token, EventMask)>,
    interests: Slab<InterestRecord>,
    by_fd: HashMap<RawFd, Token>,
    /// Scratch space for read handlers; its length caps a single read.
    read_buf: Vec<u8>,
}

impl EventLoop {
    /// Create a loop that collects up to `batch_size` events per poll and
    /// reads at most `buffer_size` bytes per read callback.
    pub fn new(batch_size: usize, buffer_size: usize) -> Result<Self, LoopError> {
        let poll = Poll::new().map_err(LoopError::Create)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(batch_size.max(1)),
            pending: Vec::with_capacity(batch_size.max(1)),
            interests: Slab::new(),
            by_fd: HashMap::new(),
            read_buf: vec![0u8; buffer_size.max(1)],
        })
    }

    /// Add a record for `fd` and arm the notifier for it.
    ///
    /// `fd` must be the descriptor owned by `handler`'s context. Fails if a
    /// record for `fd` already exists; `handler` is dropped in that case.
    pub fn register(
        &mut self,
        fd: RawFd,
        mask: EventMask,
        persistent: bool,
        handler: Handler,
    ) -> Result<Token, LoopError> {
        if self.by_fd.contains_key(&fd) {
            return Err(LoopError::AlreadyRegistered { fd });
        }
        let interest = mask.to_interest().ok_or(LoopError::EmptyMask { fd })?;

        let entry = self.interests.vacant_entry();
        let token = Token(entry.key());

        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
            .map_err(|source| LoopError::Arm { fd, source })?;

        entry.insert(InterestRecord {
            fd,
            mask,
            persistent,
            handler: Some(handler),
        });
        self.by_fd.insert(fd, token);

        trace!(fd, token = token.0, persistent, "Registered interest");
        Ok(token)
    }

    /// Remove a record and disarm the notifier for its descriptor.
    ///
    /// The notifier is disarmed before the record, and with it the owned
    /// context, is dropped, so the descriptor is closed last.
    pub fn deregister(&mut self, token: Token) -> Result<(), LoopError> {
        let record = self
            .interests
            .try_remove(token.0)
            .ok_or(LoopError::NotRegistered(token))?;
        self.by_fd.remove(&record.fd);

        self.poll
            .registry()
            .deregister(&mut SourceFd(&record.fd))
            .map_err(|source| LoopError::Disarm {
                fd: record.fd,
                source,
            })?;

        trace!(fd = record.fd, token = token.0, "Deregistered interest");
        Ok(())
    }

    /// Number of registered records.
    pub fn len(&self) -> usize {
        self.interests.len()
    }

    /// Check if no records are registered.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }

    /// Look up the record registered under `token`.
    #[cfg(test)]
    pub fn get(&self, token: Token) -> Option<&InterestRecord> {
        self.interests.get(token.0)
    }

    /// Dispatch forever. Only returns on a notifier fault.
    pub fn run(&mut self) -> Result<(), LoopError> {
        debug!(interests = self.len(), "Event loop running");
        loop {
            self.turn(None)?;
        }
    }

    /// Wait once for readiness (up to `timeout`, or forever with `None`)
    /// and dispatch one callback per ready descriptor.
    ///
    /// Returns the number of callbacks dispatched.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize, LoopError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(LoopError::Poll(e)),
        }

        let mut pending = std::mem::take(&mut self.pending);
        pending.clear();
        pending.extend(
            self.events
                .iter()
                .map(|event| (event.token(), EventMask::from_event(event))),
        );

        let mut dispatched = 0;
        for &(token, ready) in &pending {
            if self.dispatch(token, ready)? {
                dispatched += 1;
            }
        }

        self.pending = pending;
        Ok(dispatched)
    }

    /// Run the callback for `token`, then keep, re-arm, or tear down its
    /// record according to the verdict and the persistence flag.
    fn dispatch(&mut self, token: Token, ready: EventMask) -> Result<bool, LoopError> {
        let Some(record) = self.interests.get_mut(token.0) else {
            trace!(token = token.0, "Event for unknown token");
            return Ok(false);
        };
        let Some(mut handler) = record.handler.take() else {
            return Ok(false);
        };
        let persistent = record.persistent;

        let verdict = match &mut handler {
            Handler::Accept(state) => listener::on_accept(self, state)?,
            Handler::Read(state) => connection::on_read(state, token, ready, &mut self.read_buf),
        };

        if persistent && verdict == Verdict::Keep {
            let record = &mut self.interests[token.0];
            record.handler = Some(handler);
            self.rearm(token)?;
        } else {
            self.deregister(token)?;
            drop(handler);
        }

        Ok(true)
    }

    fn rearm(&mut self, token: Token) -> Result<(), LoopError> {
        let record = &self.interests[token.0];
        let fd = record.fd;
        // Non-empty masks are enforced at registration.
        let Some(interest) = record.mask.to_interest() else {
            return Err(LoopError::EmptyMask { fd });
        };

        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
            .map_err(|source| LoopError::Arm { fd, source })
    }
}
