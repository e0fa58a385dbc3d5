use crate::wire::{ByteReader, ByteWriter};
use crate::{MAX_MM_DESCS, MAX_PAGES_DESCS, MAX_PAGES_IN_SGL};
use samepage_base::{proto, Result};

pub const SHADOW_PTE_SIZE: usize = 16;

const PAGE_WINDOW_DESC_SIZE: usize = 16;
const PT_DESC_HEADER_SIZE: usize = 16;
const PT_DESC_SIZE: usize =
    PT_DESC_HEADER_SIZE + MAX_PAGES_DESCS * PAGE_WINDOW_DESC_SIZE + 8;
const ERROR_WINDOW_DESC_SIZE: usize = 16;
const ERROR_TABLE_DESC_SIZE: usize = 8 + MAX_PAGES_DESCS * ERROR_WINDOW_DESC_SIZE;

pub const METADATA_DESC_SIZE: usize = 8 + MAX_MM_DESCS * PT_DESC_SIZE + ERROR_TABLE_DESC_SIZE;
pub const RESULT_DESC_SIZE: usize = 32;

/// One entry of a host-exported shadow page table: a page-aligned virtual
/// address and the frame currently backing it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShadowPte {
    pub va: u64,
    pub pfn: u64,
}

impl ShadowPte {
    pub fn encode_slice(entries: &[ShadowPte], buf: &mut Vec<u8>) {
        let mut wr = ByteWriter::new(buf);
        for e in entries {
            wr.put_u64(e.va);
            wr.put_u64(e.pfn);
        }
    }

    pub fn decode_slice(bytes: &[u8], cnt: usize) -> Result<Vec<ShadowPte>> {
        let mut rd = ByteReader::new(bytes);
        let mut out = Vec::with_capacity(cnt);
        for _ in 0..cnt {
            let va = rd.get_u64()?;
            let pfn = rd.get_u64()?;
            out.push(ShadowPte { va, pfn });
        }
        Ok(out)
    }
}

/// Where the engine can read one window of page contents: the frames of up
/// to MAX_PAGES_IN_SGL consecutive map entries, laid out contiguously.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageWindowDesc {
    pub pages_rkey: u32,
    pub pages_base_addr: u64,
}

/// Descriptor of one address space's shadow page table for one cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShadowPtDesc {
    pub mm_id: i32,
    pub map_rkey: u32,
    pub pt_base_addr: u64,
    pub windows: Vec<PageWindowDesc>,
    pub entry_cnt: u64,
}

impl ShadowPtDesc {
    /// Windows needed to cover `entry_cnt` map entries.
    pub fn window_cnt(entry_cnt: u64) -> usize {
        entry_cnt.div_ceil(MAX_PAGES_IN_SGL as u64) as usize
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        let mut wr = ByteWriter::new(buf);
        wr.put_i32(self.mm_id);
        wr.put_u32(self.map_rkey);
        wr.put_u64(self.pt_base_addr);
        for w in &self.windows {
            wr.put_u32(w.pages_rkey);
            wr.put_pad(4);
            wr.put_u64(w.pages_base_addr);
        }
        wr.put_pad((MAX_PAGES_DESCS - self.windows.len()) * PAGE_WINDOW_DESC_SIZE);
        wr.put_u64(self.entry_cnt);
    }

    fn decode(rd: &mut ByteReader<'_>, base: usize) -> Result<ShadowPtDesc> {
        rd.seek(base)?;
        let mm_id = rd.get_i32()?;
        let map_rkey = rd.get_u32()?;
        let pt_base_addr = rd.get_u64()?;
        rd.seek(base + PT_DESC_HEADER_SIZE + MAX_PAGES_DESCS * PAGE_WINDOW_DESC_SIZE)?;
        let entry_cnt = rd.get_u64()?;
        let wcnt = Self::window_cnt(entry_cnt);
        if wcnt > MAX_PAGES_DESCS {
            return Err(proto("shadow page table exceeds descriptor window slots"));
        }
        rd.seek(base + PT_DESC_HEADER_SIZE)?;
        let mut windows = Vec::with_capacity(wcnt);
        for _ in 0..wcnt {
            let pages_rkey = rd.get_u32()?;
            rd.skip(4)?;
            let pages_base_addr = rd.get_u64()?;
            windows.push(PageWindowDesc {
                pages_rkey,
                pages_base_addr,
            });
        }
        Ok(ShadowPtDesc {
            mm_id,
            map_rkey,
            pt_base_addr,
            windows,
            entry_cnt,
        })
    }
}

/// One readable window of the host's error table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErrorWindowDesc {
    pub rkey: u64,
    pub base_addr: u64,
}

/// Where the engine can read the failures the host accumulated while
/// replaying the previous cycle's decision log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorTableDesc {
    pub total_cnt: i32,
    pub windows: Vec<ErrorWindowDesc>,
}

impl ErrorTableDesc {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut wr = ByteWriter::new(buf);
        wr.put_i32(self.total_cnt);
        wr.put_i32(self.windows.len() as i32);
        for w in &self.windows {
            wr.put_u64(w.rkey);
            wr.put_u64(w.base_addr);
        }
        wr.put_pad((MAX_PAGES_DESCS - self.windows.len()) * ERROR_WINDOW_DESC_SIZE);
    }

    fn decode(rd: &mut ByteReader<'_>) -> Result<ErrorTableDesc> {
        let total_cnt = rd.get_i32()?;
        let desc_cnt = rd.get_i32()?;
        if total_cnt < 0 || desc_cnt < 0 || desc_cnt as usize > MAX_PAGES_DESCS {
            return Err(proto("bad error table descriptor counts"));
        }
        let mut windows = Vec::with_capacity(desc_cnt as usize);
        for _ in 0..desc_cnt {
            let rkey = rd.get_u64()?;
            let base_addr = rd.get_u64()?;
            windows.push(ErrorWindowDesc { rkey, base_addr });
        }
        Ok(ErrorTableDesc { total_cnt, windows })
    }
}

/// The host's per-cycle work order: every exported shadow page table plus
/// the previous cycle's error table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataDesc {
    pub tables: Vec<ShadowPtDesc>,
    pub errors: ErrorTableDesc,
}

impl MetadataDesc {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.tables.len() > MAX_MM_DESCS {
            return Err(proto("too many shadow page tables for one descriptor"));
        }
        for t in &self.tables {
            if t.windows.len() > MAX_PAGES_DESCS {
                return Err(proto("too many page windows for one descriptor"));
            }
        }
        let mut buf = Vec::with_capacity(METADATA_DESC_SIZE);
        ByteWriter::new(&mut buf).put_u64(self.tables.len() as u64);
        for t in &self.tables {
            t.encode(&mut buf);
        }
        let pad = (MAX_MM_DESCS - self.tables.len()) * PT_DESC_SIZE;
        ByteWriter::new(&mut buf).put_pad(pad);
        self.errors.encode(&mut buf);
        debug_assert_eq!(buf.len(), METADATA_DESC_SIZE);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<MetadataDesc> {
        let mut rd = ByteReader::new(bytes);
        let pt_cnt = rd.get_u64()?;
        if pt_cnt as usize > MAX_MM_DESCS {
            return Err(proto("metadata descriptor pt_cnt out of range"));
        }
        let mut tables = Vec::with_capacity(pt_cnt as usize);
        for i in 0..pt_cnt as usize {
            tables.push(ShadowPtDesc::decode(&mut rd, 8 + i * PT_DESC_SIZE)?);
        }
        rd.seek(8 + MAX_MM_DESCS * PT_DESC_SIZE)?;
        let errors = ErrorTableDesc::decode(&mut rd)?;
        Ok(MetadataDesc { tables, errors })
    }
}

/// The engine's per-cycle reply: scan totals plus where the host can read
/// the decision log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResultDesc {
    pub total_scanned_cnt: i32,
    pub log_cnt: i32,
    pub rkey: u64,
    pub result_table_addr: u64,
}

impl ResultDesc {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RESULT_DESC_SIZE);
        let mut wr = ByteWriter::new(&mut buf);
        wr.put_i32(self.total_scanned_cnt);
        wr.put_i32(self.log_cnt);
        wr.put_u64(self.rkey);
        wr.put_u64(self.result_table_addr);
        wr.put_pad(8);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<ResultDesc> {
        let mut rd = ByteReader::new(bytes);
        let total_scanned_cnt = rd.get_i32()?;
        let log_cnt = rd.get_i32()?;
        let rkey = rd.get_u64()?;
        let result_table_addr = rd.get_u64()?;
        Ok(ResultDesc {
            total_scanned_cnt,
            log_cnt,
            rkey,
            result_table_addr,
        })
    }
}
