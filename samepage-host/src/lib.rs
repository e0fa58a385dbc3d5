// Host-side half of the protocol: shadow page tables and frame contents
// exported for one-sided reads, the decision-log replay that re-verifies
// every merge against live bytes, and the error table that carries the
// rejections forward. The kernel's actual copy-on-write installation is
// external; replay here verifies byte equality and rewrites the exported
// mapping, which is exactly the part of the contract the engine can see.

mod session;
mod shadow;

#[cfg(test)]
mod test;

pub use session::{CycleReport, HostSession};
pub use shadow::{FrameStore, ShadowMm};
