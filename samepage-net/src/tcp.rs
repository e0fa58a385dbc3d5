use crate::ram::RegionTable;
use crate::verbs::{Completion, RemoteRegion, Verbs, WcStatus, WrTag};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use samepage_base::{err, Result};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, info};

// One fixed 24-byte header per frame, then payload bytes.
//
//   op u8 | status u8 | pad u16 | rkey u32 | addr u64 | len u32 | pad u32
//
// SEND carries a descriptor as payload (`len` bytes). READ_REQ carries no
// payload; `len` is the number of bytes requested from the sender's peer at
// (rkey, addr). READ_RESP answers the most recent READ_REQ with `len`
// payload bytes; the protocol is lock-step, one read outstanding at a time.
const OP_SEND: u8 = 1;
const OP_READ_REQ: u8 = 2;
const OP_READ_RESP: u8 = 3;

const FRAME_HEADER_SIZE: usize = 24;

struct Frame {
    op: u8,
    status: u8,
    rkey: u32,
    addr: u64,
    len: u32,
    payload: Vec<u8>,
}

impl Frame {
    fn send(payload: Vec<u8>) -> Frame {
        Frame {
            op: OP_SEND,
            status: 0,
            rkey: 0,
            addr: 0,
            len: payload.len() as u32,
            payload,
        }
    }

    fn read_req(rkey: u32, addr: u64, len: u32) -> Frame {
        Frame {
            op: OP_READ_REQ,
            status: 0,
            rkey,
            addr,
            len,
            payload: Vec::new(),
        }
    }

    fn read_resp(data: Option<Vec<u8>>) -> Frame {
        let status = data.is_some() as u8;
        let payload = data.unwrap_or_default();
        Frame {
            op: OP_READ_RESP,
            status,
            rkey: 0,
            addr: 0,
            len: payload.len() as u32,
            payload,
        }
    }
}

fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
    let mut hdr = [0u8; FRAME_HEADER_SIZE];
    hdr[0] = frame.op;
    hdr[1] = frame.status;
    hdr[4..8].copy_from_slice(&frame.rkey.to_le_bytes());
    hdr[8..16].copy_from_slice(&frame.addr.to_le_bytes());
    hdr[16..20].copy_from_slice(&frame.len.to_le_bytes());
    stream.write_all(&hdr)?;
    stream.write_all(&frame.payload)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Frame> {
    let mut hdr = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut hdr)?;
    let op = hdr[0];
    let len = u32::from_le_bytes(hdr[16..20].try_into().unwrap());
    // READ_REQ's len names remote bytes, not payload bytes.
    let payload_len = if op == OP_READ_REQ { 0 } else { len as usize };
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload)?;
    Ok(Frame {
        op,
        status: hdr[1],
        rkey: u32::from_le_bytes(hdr[4..8].try_into().unwrap()),
        addr: u64::from_le_bytes(hdr[8..16].try_into().unwrap()),
        len,
        payload,
    })
}

/// The verbs contract framed over one TCP stream: a reliable-transport
/// stand-in for the external hardware layer. A service thread answers the
/// peer's one-sided read requests out of the local region table, so reads
/// proceed while this end is blocked in its own logic.
pub struct TcpVerbs {
    regions: Arc<Mutex<RegionTable>>,
    writer: Arc<Mutex<TcpStream>>,
    sends: Receiver<Vec<u8>>,
    read_resps: Receiver<Option<Vec<u8>>>,
    completions: VecDeque<Completion>,
    pending_recvs: VecDeque<WrTag>,
    pending_reads: VecDeque<WrTag>,
}

impl TcpVerbs {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        info!("connected to {}", stream.peer_addr()?);
        Self::new(stream)
    }

    /// Accept one connection; the engine serves a single peer at a time.
    pub fn accept(listener: &TcpListener) -> Result<Self> {
        let (stream, peer) = listener.accept()?;
        info!("accepted connection from {}", peer);
        Self::new(stream)
    }

    fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let regions = Arc::new(Mutex::new(RegionTable::default()));
        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        let (send_tx, sends) = unbounded();
        let (resp_tx, read_resps) = unbounded();
        let svc_regions = regions.clone();
        let svc_writer = writer.clone();
        std::thread::Builder::new()
            .name("samepage-net-svc".into())
            .spawn(move || service_loop(stream, svc_regions, svc_writer, send_tx, resp_tx))?;
        Ok(TcpVerbs {
            regions,
            writer,
            sends,
            read_resps,
            completions: VecDeque::new(),
            pending_recvs: VecDeque::new(),
            pending_reads: VecDeque::new(),
        })
    }
}

fn service_loop(
    mut stream: TcpStream,
    regions: Arc<Mutex<RegionTable>>,
    writer: Arc<Mutex<TcpStream>>,
    send_tx: Sender<Vec<u8>>,
    resp_tx: Sender<Option<Vec<u8>>>,
) {
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(f) => f,
            Err(e) => {
                debug!("transport stream closed: {}", e);
                return;
            }
        };
        match frame.op {
            OP_SEND => {
                if send_tx.send(frame.payload).is_err() {
                    return;
                }
            }
            OP_READ_REQ => {
                let data = regions
                    .lock()
                    .read(frame.rkey, frame.addr, frame.len as usize);
                if write_frame(&mut writer.lock(), &Frame::read_resp(data)).is_err() {
                    return;
                }
            }
            OP_READ_RESP => {
                let data = (frame.status == 1).then_some(frame.payload);
                if resp_tx.send(data).is_err() {
                    return;
                }
            }
            _ => {
                debug!("dropping frame with unknown op {}", frame.op);
                return;
            }
        }
    }
}

impl Verbs for TcpVerbs {
    fn register(&mut self, bytes: Vec<u8>) -> Result<RemoteRegion> {
        Ok(self.regions.lock().register(bytes))
    }

    fn invalidate(&mut self, region: RemoteRegion) -> Result<()> {
        self.regions.lock().invalidate(region)
    }

    fn post_read(&mut self, tag: WrTag, rkey: u32, addr: u64, len: usize) -> Result<()> {
        write_frame(
            &mut self.writer.lock(),
            &Frame::read_req(rkey, addr, len as u32),
        )?;
        self.pending_reads.push_back(tag);
        Ok(())
    }

    fn post_send(&mut self, tag: WrTag, bytes: &[u8]) -> Result<()> {
        write_frame(&mut self.writer.lock(), &Frame::send(bytes.to_vec()))?;
        self.completions.push_back(Completion {
            tag,
            status: WcStatus::Success,
            data: None,
        });
        Ok(())
    }

    fn post_recv(&mut self, tag: WrTag) -> Result<()> {
        self.pending_recvs.push_back(tag);
        Ok(())
    }

    fn poll(&mut self) -> Result<Completion> {
        if let Some(c) = self.completions.pop_front() {
            return Ok(c);
        }
        if let Some(tag) = self.pending_reads.pop_front() {
            let data = self
                .read_resps
                .recv()
                .map_err(|_| err("peer disconnected"))?;
            let status = if data.is_some() {
                WcStatus::Success
            } else {
                WcStatus::Fail
            };
            return Ok(Completion { tag, status, data });
        }
        if let Some(tag) = self.pending_recvs.pop_front() {
            let data = self.sends.recv().map_err(|_| err("peer disconnected"))?;
            return Ok(Completion {
                tag,
                status: WcStatus::Success,
                data: Some(data),
            });
        }
        Err(err("poll with no outstanding work requests"))
    }
}

impl Drop for TcpVerbs {
    fn drop(&mut self) {
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}
