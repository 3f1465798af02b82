//! `PacketRef` 引用计数性质。
//!
//! - 任意 retain/release 序列中，只要还有未配对的 retain，计数就不会归零；
//! - 最后一个未配对的 release 恰好让计数归零，并把 slab 区间归还分配器；
//! - 对已归零的句柄再次 release 在类型层面不可表达（`release` 消耗句柄）。

#![cfg(not(loom))]

use otlpgw_core::{
    AllocationTag, PacketAllocator, PacketDescriptor, PacketRef, SignalKind, SlabPacketAllocator,
};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum RefOp {
    Retain(usize),
    Release(usize),
}

fn ops() -> impl Strategy<Value = Vec<RefOp>> {
    prop::collection::vec(
        prop_oneof![
            (0usize..16).prop_map(RefOp::Retain),
            (0usize..16).prop_map(RefOp::Release),
        ],
        0..64,
    )
}

proptest! {
    #[test]
    fn count_tracks_outstanding_handles(ops in ops()) {
        let allocator = SlabPacketAllocator::new(256);
        let tag = AllocationTag::new("prop", "refcount", SignalKind::Logs);
        let first = allocator.allocate(24, tag).expect("granted");
        let mut handles = vec![first];

        for op in ops {
            match op {
                RefOp::Retain(pick) => {
                    let source = &handles[pick % handles.len()];
                    let retained = source.retain();
                    handles.push(retained);
                }
                RefOp::Release(pick) => {
                    if handles.len() == 1 {
                        // 保留最后一个句柄，留到序列结束后统一检查。
                        continue;
                    }
                    let released = handles.swap_remove(pick % handles.len());
                    prop_assert!(!released.release());
                }
            }
            prop_assert_eq!(handles[0].ref_count(), handles.len());
            prop_assert_eq!(allocator.stats().in_use_bytes, 24u64.next_multiple_of(8));
        }

        let last = handles.pop().expect("one handle left");
        for remaining in handles.drain(..) {
            prop_assert!(!remaining.release());
            prop_assert_eq!(allocator.stats().in_use_bytes, 24);
        }
        prop_assert_eq!(last.ref_count(), 1);
        prop_assert!(last.release());
        prop_assert_eq!(allocator.stats().in_use_bytes, 0);
        prop_assert_eq!(allocator.stats().release_count, 1);
    }
}

#[test]
fn handles_are_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<PacketRef>();
}

#[test]
fn wrapped_packet_round_trips_across_threads() {
    let packet = PacketRef::wrap(b"payload".to_vec(), PacketDescriptor::for_signal(SignalKind::Traces));
    let shared = packet.retain();
    let seen = std::thread::spawn(move || shared.payload().to_vec())
        .join()
        .expect("reader thread");
    assert_eq!(seen, b"payload");
    assert!(packet.release());
}
