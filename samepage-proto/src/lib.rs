// Wire contract between host and engine. Everything here is fixed-layout
// little-endian with 8-byte alignment: descriptors are exchanged by
// send/recv into preallocated buffers, so every encoder emits the full
// fixed size and every decoder reads from a buffer of at least that size.
//
// Record and descriptor layouts:
//
// - event record: 32 bytes, u32 tag + 4 pad + 24-byte payload union
// - shadow pte: u64 va + u64 pfn
// - pt_desc: mm_id/map_rkey/pt_base_addr + MAX_PAGES_DESCS window slots + entry_cnt
// - error table descriptor: total_cnt/desc_cnt + MAX_PAGES_DESCS window slots
// - metadata descriptor: pt_cnt + MAX_MM_DESCS pt_desc slots + error table
// - result descriptor: 32 bytes

mod descr;
mod log;
mod record;
mod wire;


pub use descr::{
    ErrorTableDesc, ErrorWindowDesc, MetadataDesc, PageWindowDesc, ResultDesc, ShadowPtDesc,
    ShadowPte, METADATA_DESC_SIZE, RESULT_DESC_SIZE, SHADOW_PTE_SIZE,
};
pub use log::EventLog;
pub use record::{EventRecord, EVENT_RECORD_SIZE};

pub const MAX_MM_DESCS: usize = 32;
pub const MAX_PAGES_DESCS: usize = 512;
// Covers up to 2 GiB of page payload per scatter-gather window.
pub const MAX_PAGES_IN_SGL: usize = 65536;
