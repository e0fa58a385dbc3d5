use samepage_base::{err, Result, PAGE_SIZE};
use samepage_proto::ShadowPte;
use std::collections::BTreeMap;

/// Stand-in for host physical memory: frame number to 4 KiB contents.
#[derive(Debug, Default)]
pub struct FrameStore {
    frames: BTreeMap<u64, Vec<u8>>,
}

impl FrameStore {
    pub fn new() -> FrameStore {
        FrameStore::default()
    }

    pub fn insert(&mut self, pfn: u64, content: Vec<u8>) -> Result<()> {
        if content.len() != PAGE_SIZE {
            return Err(err("frame content must be exactly one page"));
        }
        self.frames.insert(pfn, content);
        Ok(())
    }

    /// Overwrite an existing frame, like a guest write landing on it.
    pub fn write(&mut self, pfn: u64, content: Vec<u8>) -> Result<()> {
        if !self.frames.contains_key(&pfn) {
            return Err(err("writing a frame that was never inserted"));
        }
        self.insert(pfn, content)
    }

    pub fn read(&self, pfn: u64) -> Option<&[u8]> {
        self.frames.get(&pfn).map(|v| v.as_slice())
    }

    pub fn same_content(&self, a: u64, b: u64) -> bool {
        match (self.read(a), self.read(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }
}

/// One address space's shadow page table, in the order the host walked the
/// space. Exported to the engine once per cycle; replay rewrites frame
/// numbers in place when merges succeed.
#[derive(Debug)]
pub struct ShadowMm {
    pub mm_id: i32,
    entries: Vec<ShadowPte>,
}

impl ShadowMm {
    pub fn new(mm_id: i32) -> ShadowMm {
        ShadowMm {
            mm_id,
            entries: Vec::new(),
        }
    }

    /// Append one walked page. The engine rejects a table whose first
    /// virtual address is zero, so hosts must never export va 0.
    pub fn push(&mut self, va: u64, pfn: u64) {
        self.entries.push(ShadowPte { va, pfn });
    }

    pub fn entries(&self) -> &[ShadowPte] {
        &self.entries
    }

    pub fn entry_cnt(&self) -> usize {
        self.entries.len()
    }

    pub fn pfn_of(&self, va: u64) -> Option<u64> {
        self.entries.iter().find(|e| e.va == va).map(|e| e.pfn)
    }

    /// Point a virtual address at a (possibly shared) frame.
    pub fn set_pfn(&mut self, va: u64, pfn: u64) -> Result<()> {
        match self.entries.iter_mut().find(|e| e.va == va) {
            Some(e) => {
                e.pfn = pfn;
                Ok(())
            }
            None => Err(err("remapping a virtual address that is not exported")),
        }
    }
}
