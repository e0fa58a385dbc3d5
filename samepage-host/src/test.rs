use crate::{FrameStore, HostSession, ShadowMm};
use samepage_base::{PageKey, PAGE_SIZE};
use samepage_net::{ram_pair, Connection};
use samepage_proto::EventRecord;
use test_log::test;

fn page_of(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}

#[test]
fn test_frame_store() {
    let mut store = FrameStore::new();
    assert!(store.insert(1, vec![0; 10]).is_err());
    store.insert(1, page_of(1)).unwrap();
    store.insert(2, page_of(1)).unwrap();
    store.insert(3, page_of(3)).unwrap();
    assert!(store.same_content(1, 2));
    assert!(!store.same_content(1, 3));
    assert!(!store.same_content(1, 99));
    store.write(2, page_of(9)).unwrap();
    assert!(!store.same_content(1, 2));
    assert!(store.write(99, page_of(0)).is_err());
}

#[test]
fn test_shadow_mm() {
    let mut mm = ShadowMm::new(7);
    mm.push(0x1000, 10);
    mm.push(0x2000, 20);
    assert_eq!(mm.entry_cnt(), 2);
    assert_eq!(mm.pfn_of(0x2000), Some(20));
    mm.set_pfn(0x2000, 10).unwrap();
    assert_eq!(mm.pfn_of(0x2000), Some(10));
    assert!(mm.set_pfn(0x9000, 1).is_err());
}

fn session_with_pair() -> HostSession {
    // The peer end is leaked alive so reads never see a disconnect; replay
    // tests do not touch the wire anyway.
    let (h, e) = ram_pair();
    std::mem::forget(e);
    let mut session = HostSession::new(Connection::new(Box::new(h)));
    session.store_mut().insert(10, page_of(1)).unwrap();
    session.store_mut().insert(20, page_of(1)).unwrap();
    session.store_mut().insert(30, page_of(3)).unwrap();
    let mm = session.mm_mut(1);
    mm.push(0x1000, 10);
    mm.push(0x2000, 20);
    mm.push(0x3000, 30);
    session
}

#[test]
fn test_replay_unstable_merge() {
    let mut session = session_with_pair();
    let a = PageKey::new(1, 0x1000);
    let b = PageKey::new(1, 0x2000);
    // The engine promoted b and a together; b's frame becomes shared.
    let failures = session
        .replay(&[EventRecord::UnstableMerge { from: b, to: a }])
        .unwrap();
    assert_eq!(failures, 0);
    assert_eq!(session.mm_mut(1).pfn_of(0x1000), Some(20));
    assert_eq!(session.merged_pages().get(&a), Some(&20));
    assert_eq!(session.merged_pages().get(&b), Some(&20));
    assert!(session.error_table().is_empty());
}

#[test]
fn test_replay_rejects_changed_page() {
    let mut session = session_with_pair();
    let a = PageKey::new(1, 0x1000);
    let b = PageKey::new(1, 0x2000);
    // A guest write landed on b's frame after the engine scanned it.
    session.store_mut().write(20, page_of(0xff)).unwrap();
    let failures = session
        .replay(&[EventRecord::UnstableMerge { from: b, to: a }])
        .unwrap();
    assert_eq!(failures, 1);
    assert_eq!(session.mm_mut(1).pfn_of(0x1000), Some(10));
    assert!(session.merged_pages().is_empty());
    assert_eq!(session.error_table().len(), 1);
    assert_eq!(
        session.error_table().iter().next().unwrap().unwrap(),
        EventRecord::HostMergeTwoFailed { from: b, to: a }
    );
}

#[test]
fn test_replay_stable_merge_and_state_change() {
    let mut session = session_with_pair();
    let a = PageKey::new(1, 0x1000);
    let failures = session
        .replay(&[EventRecord::StableMerge {
            from: a,
            kpfn: 20,
            shared_cnt: 2,
        }])
        .unwrap();
    assert_eq!(failures, 0);
    assert_eq!(session.merged_pages().get(&a), Some(&20));

    // The engine later detached the item; the host forgets the share.
    session
        .replay(&[EventRecord::ItemStateChange {
            item: a,
            kpfn: 20,
            shared_cnt: 1,
        }])
        .unwrap();
    assert!(session.merged_pages().get(&a).is_none());
}

#[test]
fn test_replay_rejects_stable_merge_on_mismatch() {
    let mut session = session_with_pair();
    let c = PageKey::new(1, 0x3000);
    // c's frame holds different bytes than the shared frame.
    let failures = session
        .replay(&[EventRecord::StableMerge {
            from: c,
            kpfn: 20,
            shared_cnt: 2,
        }])
        .unwrap();
    assert_eq!(failures, 1);
    assert_eq!(
        session.error_table().iter().next().unwrap().unwrap(),
        EventRecord::HostMergeOneFailed { from: c, kpfn: 20 }
    );
}

#[test]
fn test_replay_stale_node_retires_shares() {
    let mut session = session_with_pair();
    let a = PageKey::new(1, 0x1000);
    let b = PageKey::new(1, 0x2000);
    session
        .replay(&[EventRecord::UnstableMerge { from: b, to: a }])
        .unwrap();
    session
        .replay(&[EventRecord::StaleStableNode { last: a, kpfn: 20 }])
        .unwrap();
    assert!(session.merged_pages().is_empty());
}

#[test]
fn test_replay_rejects_host_origin_records() {
    let mut session = session_with_pair();
    let a = PageKey::new(1, 0x1000);
    assert!(session
        .replay(&[EventRecord::HostMergeOneFailed { from: a, kpfn: 20 }])
        .is_err());
}
