use crate::{ram_pair, ConnState, Connection, TcpVerbs, WrTag};
use test_log::test;

#[test]
fn test_ram_send_recv() {
    let (a, b) = ram_pair();
    let mut a = Connection::new(Box::new(a));
    let mut b = Connection::new(Box::new(b));

    b.post_recv(WrTag::RecvMetadata).unwrap();
    a.send(WrTag::SendMetadata, b"hello").unwrap();
    let got = b.complete_recv(WrTag::RecvMetadata).unwrap();
    assert_eq!(got, b"hello");
}

#[test]
fn test_ram_one_sided_read() {
    let (a, b) = ram_pair();
    let mut a = Connection::new(Box::new(a));
    let mut b = Connection::new(Box::new(b));

    let region = a.register(vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    let got = b
        .read(WrTag::ReadMap, region.rkey, region.addr + 2, 4)
        .unwrap();
    assert_eq!(got, [3, 4, 5, 6]);

    // Reading past the region fails the work request and latches the
    // connection into the error state.
    assert!(b.read(WrTag::ReadMap, region.rkey, 0, 64).is_err());
    assert_eq!(b.state(), ConnState::Error);
    assert!(b.read(WrTag::ReadMap, region.rkey, 0, 1).is_err());
}

#[test]
fn test_ram_invalidate() {
    let (a, b) = ram_pair();
    let mut a = Connection::new(Box::new(a));
    let mut b = Connection::new(Box::new(b));

    let region = a.register(vec![9; 16]).unwrap();
    a.invalidate(region).unwrap();
    assert!(a.invalidate(region).is_err());
    assert!(b.read(WrTag::ReadResult, region.rkey, 0, 16).is_err());
}

#[test]
fn test_ram_disconnect() {
    let (a, b) = ram_pair();
    let mut a = Connection::new(Box::new(a));
    a.post_recv(WrTag::RecvMetadata).unwrap();
    drop(b);
    assert!(a.complete_recv(WrTag::RecvMetadata).is_err());
    assert_eq!(a.state(), ConnState::Error);
}

#[test]
fn test_tcp_roundtrip() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::thread::spawn(move || {
        let mut conn = Connection::new(Box::new(TcpVerbs::connect(addr).unwrap()));
        let region = conn.register(vec![0xaa; 64]).unwrap();
        conn.send(WrTag::SendMetadata, &region.rkey.to_le_bytes())
            .unwrap();
        conn.post_recv(WrTag::RecvResult).unwrap();
        let reply = conn.complete_recv(WrTag::RecvResult).unwrap();
        assert_eq!(reply, b"done");
    });

    let mut server = Connection::new(Box::new(TcpVerbs::accept(&listener).unwrap()));
    server.post_recv(WrTag::RecvMetadata).unwrap();
    let rkey_bytes = server.complete_recv(WrTag::RecvMetadata).unwrap();
    let rkey = u32::from_le_bytes(rkey_bytes.try_into().unwrap());
    let data = server.read(WrTag::ReadPage, rkey, 8, 16).unwrap();
    assert_eq!(data, vec![0xaa; 16]);
    server.send(WrTag::SendResult, b"done").unwrap();
    client.join().unwrap();
}
