// Transport contract consumed by the engine and the host: tagged work
// requests, one-sided reads of registered regions, send/recv of fixed-size
// descriptors, and a per-connection state word. The verbs hardware layer is
// external; two software providers ship here, an in-process loopback pair
// and a TCP-framed emulation.

mod conn;
mod ram;
mod tcp;
mod verbs;

#[cfg(test)]
mod test;

pub use conn::{ConnState, Connection};
pub use ram::{ram_pair, RamVerbs};
pub use tcp::TcpVerbs;
pub use verbs::{Completion, RemoteRegion, Verbs, WcStatus, WrTag};
