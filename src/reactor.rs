//! Single-threaded readiness-based event loop over `mio::Poll`.
//!
//! Everything in this crate that touches a socket runs on the thread that calls
//! [`Reactor::poll_once`]. There is no internal locking: the reactor owns the `mio::Poll`
//! registry, hands out [`Token`]s on registration, and returns raw readiness notifications for
//! the caller (`Runtime`, see `runtime.rs`) to route to the right `Conn`.

use crate::error::{Error, Result};
use mio::{Events, Interest, Poll, Token};
use std::time::Duration;

/// How long a single `poll` call may block before returning control to the caller even if
/// nothing became ready. Bounded so the reactor can also notice resolver completions and
/// shutdown requests delivered through the waker promptly.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// The reserved token used by the shutdown/resolver waker. Real sockets are registered starting
/// from [`FIRST_DYNAMIC_TOKEN`].
pub const WAKER_TOKEN: Token = Token(0);
pub const FIRST_DYNAMIC_TOKEN: usize = 1;

/// A single readiness notification, translated out of `mio`'s bitflags into the three classes the
/// rest of the crate cares about.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    next_token: usize,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::reactor(format!("failed to create poll: {e}")))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            next_token: FIRST_DYNAMIC_TOKEN,
        })
    }

    /// Mint a fresh, never-reused token for a new registration.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn register<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> Result<()> {
        self.poll
            .registry()
            .register(source, token, interests)
            .map_err(|e| Error::reactor(format!("register failed: {e}")))
    }

    pub fn reregister<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> Result<()> {
        self.poll
            .registry()
            .reregister(source, token, interests)
            .map_err(|e| Error::reactor(format!("reregister failed: {e}")))
    }

    pub fn deregister<S: mio::event::Source + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        self.poll
            .registry()
            .deregister(source)
            .map_err(|e| Error::reactor(format!("deregister failed: {e}")))
    }

    /// A registry handle, for constructing a `mio::Waker` bound to this reactor.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Block for up to [`POLL_TIMEOUT`], then hand back every readiness notification received.
    pub fn poll_once(&mut self) -> Result<Vec<Readiness>> {
        self.events.clear();
        match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(Error::reactor(format!("poll failed: {e}"))),
        }

        Ok(self
            .events
            .iter()
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                hangup: event.is_read_closed() || event.is_write_closed(),
            })
            .collect())
    }
}
