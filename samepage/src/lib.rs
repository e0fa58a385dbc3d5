// samepage offloads same-page-merging scans to a remote engine reached
// over a reliable RDMA-style transport. The host exports shadow page
// tables and frame contents for one-sided reads; the engine hashes and
// indexes pages, decides merges, and ships a decision log back; the host
// replays the log against live bytes and returns the rejections so the
// engine can roll stale metadata back before the next round.
//
// The subsystem crates do the work; this crate is the engine executable
// plus the end-to-end cycle tests over an in-process loopback pair.

pub use samepage_base as base;
pub use samepage_engine as engine;
pub use samepage_host as host;
pub use samepage_net as net;
pub use samepage_proto as proto;
