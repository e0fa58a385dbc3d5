use samepage_base::Result;

/// Tag carried by every work request; the completion path routes on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrTag {
    SendMetadata,
    RecvMetadata,
    SendResult,
    RecvResult,
    RegMr,
    ReadMap,
    ReadPage,
    ReadResult,
    InvalidateMr,
}

impl WrTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            WrTag::SendMetadata => "SEND_METADATA",
            WrTag::RecvMetadata => "RECV_METADATA",
            WrTag::SendResult => "SEND_RESULT",
            WrTag::RecvResult => "RECV_RESULT",
            WrTag::RegMr => "REG_MR",
            WrTag::ReadMap => "READ_MAP",
            WrTag::ReadPage => "READ_PAGE",
            WrTag::ReadResult => "READ_RESULT",
            WrTag::InvalidateMr => "INVALIDATE_MR",
        }
    }
}

impl std::fmt::Display for WrTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion status of a work request. Flushed requests are the normal
/// debris of a teardown and are drained silently; anything else that is not
/// success poisons the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    FlushErr,
    Fail,
}

/// One completion, as surfaced by a verbs provider. Read and recv
/// completions carry the transferred bytes.
#[derive(Clone, Debug)]
pub struct Completion {
    pub tag: WrTag,
    pub status: WcStatus,
    pub data: Option<Vec<u8>>,
}

/// Key/address pair advertised to the peer for one-sided reads. Addresses
/// are offsets within the registered region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteRegion {
    pub rkey: u32,
    pub addr: u64,
}

/// The four operations the core consumes from a reliable RDMA transport:
/// region registration, tagged one-sided reads, and send/recv of
/// descriptors, with completions polled off a single queue.
pub trait Verbs: Send {
    /// Publish bytes for remote read; the returned region is valid until
    /// invalidated or the connection drops.
    fn register(&mut self, bytes: Vec<u8>) -> Result<RemoteRegion>;

    fn invalidate(&mut self, region: RemoteRegion) -> Result<()>;

    /// Post a one-sided read of `len` bytes of peer memory at
    /// (rkey, addr); the bytes arrive with the completion.
    fn post_read(&mut self, tag: WrTag, rkey: u32, addr: u64, len: usize) -> Result<()>;

    fn post_send(&mut self, tag: WrTag, bytes: &[u8]) -> Result<()>;

    /// Post intent to receive the peer's next send; the payload arrives
    /// with the completion.
    fn post_recv(&mut self, tag: WrTag) -> Result<()>;

    /// Block for the next completion.
    fn poll(&mut self) -> Result<Completion>;
}
