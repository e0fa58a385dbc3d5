// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. A fault class on every error, because the connection loop treats the classes
//    differently: a transport fault ends the current scan cycle, an invariant fault
//    poisons the connection, a protocol fault rejects the descriptor that carried it.

use backtrace_error::DynBacktraceError;
use std::borrow::Cow;
use tracing::error;

#[cfg(test)]
use test_log::test;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transport,
    Invariant,
    Protocol,
}

#[derive(Debug)]
pub struct Error {
    fault: Fault,
    #[allow(dead_code)]
    inner: DynBacktraceError,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        // Errors propagated from libraries (io, channels, joins) are all
        // failures of the surrounding machinery, not of merge metadata.
        Error::new(Fault::Transport, err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(fault: Fault, err: E) -> Error {
        error!(target: "samepage", "{:?}: {:?}", fault, err);
        let dbe = DynBacktraceError::from(err);
        Error { fault, inner: dbe }
    }

    pub fn fault(&self) -> Fault {
        self.fault
    }

    pub fn is_invariant(&self) -> bool {
        self.fault == Fault::Invariant
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(Fault::Transport, SimpleErr(msg.into()))
}

pub fn inv(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(Fault::Invariant, SimpleErr(msg.into()))
}

pub fn proto(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(Fault::Protocol, SimpleErr(msg.into()))
}

#[test]
fn test_error_faults() {
    assert_eq!(err("cycle aborted").fault(), Fault::Transport);
    assert_eq!(inv("shared_cnt underflow").fault(), Fault::Invariant);
    assert_eq!(proto("bad record tag").fault(), Fault::Protocol);
    let from_io: Error = std::io::Error::new(std::io::ErrorKind::Other, "eof").into();
    assert_eq!(from_io.fault(), Fault::Transport);
}
