use crate::verbs::{Completion, RemoteRegion, Verbs, WcStatus, WrTag};
use samepage_base::{err, Result};
use tracing::{debug, error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Established,
    Error,
}

/// A live connection: a verbs provider plus the connection state word.
/// Completion handling is centralized here: flushed work requests are
/// drained silently, any other failure latches `Error` and every later
/// operation refuses to run until the caller tears the connection down.
pub struct Connection {
    verbs: Box<dyn Verbs>,
    state: ConnState,
}

impl Connection {
    pub fn new(verbs: Box<dyn Verbs>) -> Self {
        Connection {
            verbs,
            state: ConnState::Established,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    fn check_live(&self) -> Result<()> {
        if self.state != ConnState::Established {
            return Err(err("connection is not established"));
        }
        Ok(())
    }

    fn wait(&mut self, tag: WrTag) -> Result<Completion> {
        loop {
            let c = match self.verbs.poll() {
                Ok(c) => c,
                Err(e) => {
                    self.state = ConnState::Error;
                    return Err(e);
                }
            };
            match c.status {
                WcStatus::FlushErr => {
                    debug!("drained flushed work request: {}", c.tag);
                    continue;
                }
                WcStatus::Fail => {
                    error!("work request failed: {}", c.tag);
                    self.state = ConnState::Error;
                    return Err(err("work request completed with failure"));
                }
                WcStatus::Success => {
                    if c.tag != tag {
                        // The protocol is lock-step; a completion for
                        // anything but the op we are waiting on means the
                        // peer and we disagree about where we are.
                        error!("expected completion {}, got {}", tag, c.tag);
                        self.state = ConnState::Error;
                        return Err(err("unexpected completion tag"));
                    }
                    return Ok(c);
                }
            }
        }
    }

    /// One-sided read, run to completion.
    pub fn read(&mut self, tag: WrTag, rkey: u32, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.check_live()?;
        self.verbs.post_read(tag, rkey, addr, len)?;
        let c = self.wait(tag)?;
        c.data.ok_or_else(|| err("read completion carried no data"))
    }

    /// Send a descriptor, run to completion.
    pub fn send(&mut self, tag: WrTag, bytes: &[u8]) -> Result<()> {
        self.check_live()?;
        self.verbs.post_send(tag, bytes)?;
        self.wait(tag)?;
        Ok(())
    }

    /// Post a receive without waiting; pair with `complete_recv`.
    pub fn post_recv(&mut self, tag: WrTag) -> Result<()> {
        self.check_live()?;
        self.verbs.post_recv(tag)
    }

    pub fn complete_recv(&mut self, tag: WrTag) -> Result<Vec<u8>> {
        self.check_live()?;
        let c = self.wait(tag)?;
        c.data.ok_or_else(|| err("recv completion carried no data"))
    }

    pub fn register(&mut self, bytes: Vec<u8>) -> Result<RemoteRegion> {
        self.check_live()?;
        self.verbs.register(bytes)
    }

    pub fn invalidate(&mut self, region: RemoteRegion) -> Result<()> {
        self.check_live()?;
        self.verbs.invalidate(region)
    }

    /// Latch the error state from outside the completion path (invariant
    /// faults refuse further scans on this connection).
    pub fn poison(&mut self) {
        self.state = ConnState::Error;
    }
}
