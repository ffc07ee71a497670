// End-to-end scenarios over the public API: cache, LRU table, aggregator
// and the context manager driving them against an in-memory stream.

use ctxsync_core::commands::{ContextUpdateHeader, RecordHeader};
use ctxsync_core::{
    CachedContext, CommLru, CommandStream, ContextFields, ContextManager, ContextState,
    FixedQueuePairs, NicAggregator, RequiredContext, StaticTopology, SyncError,
};
use ctxsync_types::{CommId, CommandSchema, DeviceId, HardwareParams, PortId, PortMask};

fn base_required() -> RequiredContext {
    RequiredContext::new()
        .with_reduction_opcode(2)
        .with_sync_object(0x8000)
        .with_address_msb(0x11)
        .with_stride(128)
}

fn two_device_topology() -> StaticTopology {
    StaticTopology::builder()
        .scale_up(PortId(0), DeviceId(1))
        .scale_up(PortId(1), DeviceId(1))
        .scale_up(PortId(2), DeviceId(2))
        .scale_up(PortId(3), DeviceId(2))
        .build()
        .unwrap()
}

#[test]
fn lru_capacity_three_reassigns_evicted_comm_a_fresh_slot() {
    let mut lru = CommLru::new(3, 8).unwrap();
    let [a, b, c, d] = [CommId(0), CommId(1), CommId(2), CommId(3)];

    let slot_a = lru.use_comm(a).unwrap().slot;
    lru.use_comm(b).unwrap();
    lru.use_comm(c).unwrap();

    let out = lru.use_comm(d).unwrap();
    assert_eq!(out.evicted, Some(a));
    assert_eq!(out.slot, slot_a);
    assert!(!lru.is_active(a));

    let out = lru.use_comm(a).unwrap();
    assert!(!out.hit);
    assert_eq!(out.evicted, Some(b));
    assert_ne!(out.slot, slot_a);
    assert_eq!(lru.slot_of(d), Some(slot_a));
    assert_eq!(lru.recency_order(), vec![a, d, c]);
    lru.check_invariants().unwrap();
}

#[test]
fn stride_only_change_touches_one_field() {
    let mut cached = CachedContext::new(0, 4);
    let first = base_required();
    let diff = cached.diff(&first);
    cached.apply(&first, &diff).unwrap();
    let slot_before = cached.last_sync_slot();

    let second = first.with_stride(256);
    let diff = cached.diff(&second);
    assert_eq!(diff.fields, ContextFields::STRIDE);
    assert_eq!(diff.fields.count(), 1);

    cached.apply(&second, &diff).unwrap();
    assert_eq!(cached.stride(), 256);
    assert_eq!(cached.reduction_opcode(), 2);
    assert_eq!(cached.address_msb(), 0x11);
    assert_eq!(cached.last_sync_slot(), slot_before);
    assert!(cached.diff(&second).is_empty());
}

#[test]
fn eight_ports_two_values_make_two_records() {
    let params = HardwareParams::default();
    let schema = CommandSchema::default();
    let mut agg = NicAggregator::new(&params, &schema, PortMask::first(8));
    let values = [0x10u32, 0x10, 0x10, 0x10, 0x20, 0x20, 0x10, 0x10];
    let buffers: Vec<(PortId, [u32; 1])> = values
        .iter()
        .enumerate()
        .map(|(port, v)| (PortId(port as u8), [*v]))
        .collect();
    agg.push_port_buffers(&buffers).unwrap();

    let records = agg.pending_records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].dup_mask.count(), 6);
    assert_eq!(agg.payload(&records[0]), &[0x10]);
    assert_eq!(records[1].dup_mask.count(), 2);
    assert_eq!(agg.payload(&records[1]), &[0x20]);
}

#[test]
fn short_device_gets_exactly_the_missing_credits() {
    let params = HardwareParams::default();
    let schema = CommandSchema::default();
    let x = PortId(3);
    let y = PortId(7);
    let mut agg = NicAggregator::new(&params, &schema, [x, y].into_iter().collect());
    // x: one record of 2 dwords; y: records of 3 and 2 dwords
    agg.push_port_buffers(&[(x, vec![1u32]), (y, vec![5, 6, 7])])
        .unwrap();

    let mut stream = CommandStream::new();
    agg.flush(&mut stream).unwrap();

    let words = stream.command_dwords(0).unwrap();
    let mut nops = Vec::new();
    let mut i = 1;
    while i < words.len() {
        let header = RecordHeader::decode(&schema, words[i]);
        if header.nop {
            nops.push(header);
        }
        i += header.dwords();
    }
    assert_eq!(nops.len(), 1);
    assert_eq!(nops[0].dup_mask, x.mask());
    assert_eq!(nops[0].credits, 3);
}

#[test]
fn manager_hit_with_no_changes_emits_nothing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let params = HardwareParams::default();
    let schema = CommandSchema::default();
    let topo = two_device_topology();
    let qps = FixedQueuePairs::uniform(9);
    let mut mgr = ContextManager::new(&params, &schema, &topo, &qps).unwrap();
    let mut stream = CommandStream::new();
    mgr.create_collective_contexts(&mut stream).unwrap();
    mgr.register_comm(CommId(3)).unwrap();

    let required = base_required().with_remote_peers(1 << 2);
    let first = mgr
        .update_collective_context_scale_up(1, CommId(3), &required, &mut stream)
        .unwrap();
    assert!(!first.fields.is_empty());

    let emitted = stream.len();
    let again = mgr
        .update_collective_context_scale_up(1, CommId(3), &required, &mut stream)
        .unwrap();
    assert_eq!(again.lru_slot, first.lru_slot);
    assert!(again.lru_hit);
    assert!(again.fields.is_empty());
    assert_eq!(stream.len(), emitted);
}

#[test]
fn alternating_sync_objects_ping_pong_between_slots() {
    let params = HardwareParams::default();
    let schema = CommandSchema::default();
    let topo = two_device_topology();
    let qps = FixedQueuePairs::uniform(9);
    let mut mgr = ContextManager::new(&params, &schema, &topo, &qps).unwrap();
    mgr.create_collective_contexts(&mut CommandStream::new()).unwrap();
    mgr.register_comm(CommId(0)).unwrap();

    let mut stream = CommandStream::new();
    let a = base_required().with_sync_object(0xa000);
    let b = base_required().with_sync_object(0xb000);

    let out = mgr
        .update_collective_context_scale_up(0, CommId(0), &a, &mut stream)
        .unwrap();
    assert_eq!(out.sync_slot, 0);
    assert!(out.fields.contains(ContextFields::SYNC_OBJECT_0));

    let out = mgr
        .update_collective_context_scale_up(0, CommId(0), &b, &mut stream)
        .unwrap();
    assert_eq!(out.sync_slot, 1);
    assert_eq!(out.fields, ContextFields::SYNC_OBJECT_1);

    // both addresses are now cached: switching back is free
    let out = mgr
        .update_collective_context_scale_up(0, CommId(0), &a, &mut stream)
        .unwrap();
    assert_eq!(out.sync_slot, 0);
    assert!(out.fields.is_empty());

    // a third address overwrites the slot not used last
    let c = base_required().with_sync_object(0xc000);
    let out = mgr
        .update_collective_context_scale_up(0, CommId(0), &c, &mut stream)
        .unwrap();
    assert_eq!(out.sync_slot, 1);
    let words = stream.command_dwords(stream.len() - 1).unwrap();
    let header = ContextUpdateHeader::decode(&schema, words[0]);
    assert_eq!(header.sync_slot, 1);
    assert_eq!(header.fields, ContextFields::SYNC_OBJECT_1);
    assert_eq!(&words[1..], &[0xc000]);
}

#[test]
fn eviction_marks_contexts_and_rebinds_on_next_update() {
    let params = HardwareParams {
        context_slot_capacity: 2,
        ..Default::default()
    };
    let schema = CommandSchema::default();
    let topo = two_device_topology();
    let qps = FixedQueuePairs::from_fn(|comm, _, _| 10 + comm.0);
    let mut mgr = ContextManager::new(&params, &schema, &topo, &qps).unwrap();
    mgr.create_collective_contexts(&mut CommandStream::new()).unwrap();
    for comm in 0..3 {
        mgr.register_comm(CommId(comm)).unwrap();
    }

    let required = base_required().with_remote_peers(1 << 1);
    let mut stream = CommandStream::new();
    for (ctx, comm) in [(0, 0), (1, 1)] {
        mgr.update_collective_context_scale_up(ctx, CommId(comm), &required, &mut stream)
            .unwrap();
    }

    let out = mgr
        .update_collective_context_scale_up(2, CommId(2), &required, &mut stream)
        .unwrap();
    assert_eq!(out.evicted, Some(CommId(0)));
    assert_eq!(mgr.context_state(0), Some(ContextState::Evicted(CommId(0))));
    assert_eq!(mgr.context_state(2), Some(ContextState::Active(CommId(2))));
    assert!(mgr.requires_lru_update(0, CommId(0)));

    // back on context 0: same registers, but the slot binding is stale
    let out = mgr
        .update_collective_context_scale_up(0, CommId(0), &required, &mut stream)
        .unwrap();
    assert_eq!(out.evicted, Some(CommId(1)));
    assert_eq!(out.fields, ContextFields::QUEUE_PAIRS);
    let words = stream.command_dwords(stream.len() - 1).unwrap();
    let header = ContextUpdateHeader::decode(&schema, words[0]);
    assert_eq!(header.comm_slot, out.lru_slot);
    assert_eq!(&words[1..], &[10]);
    assert_eq!(mgr.context_state(0), Some(ContextState::Active(CommId(0))));
    assert_eq!(mgr.lru_stats().evictions, 2);
}

#[test]
fn unregister_frees_slot_and_resets_contexts() {
    let params = HardwareParams::default();
    let schema = CommandSchema::default();
    let topo = two_device_topology();
    let qps = FixedQueuePairs::uniform(1);
    let mut mgr = ContextManager::new(&params, &schema, &topo, &qps).unwrap();
    mgr.create_collective_contexts(&mut CommandStream::new()).unwrap();
    mgr.register_comm(CommId(40)).unwrap();

    let mut stream = CommandStream::new();
    let out = mgr
        .update_collective_context_scale_up(3, CommId(40), &base_required(), &mut stream)
        .unwrap();
    assert!(mgr.lru().is_active(CommId(40)));

    mgr.unregister_comm(CommId(40)).unwrap();
    assert!(!mgr.lru().is_active(CommId(40)));
    assert_eq!(mgr.context_state(3), Some(ContextState::Unused));
    assert!(mgr.context(3).unwrap().comm_binding().is_none());

    let err = mgr.unregister_comm(CommId(40)).unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));

    mgr.register_comm(CommId(41)).unwrap();
    let next = mgr
        .update_collective_context_scale_up(3, CommId(41), &base_required(), &mut stream)
        .unwrap();
    assert_eq!(next.lru_slot, out.lru_slot);
}

#[test]
fn shared_queue_pair_over_two_devices_is_one_global_update() {
    let params = HardwareParams::default();
    let schema = CommandSchema::default();
    let topo = two_device_topology();
    let qps = FixedQueuePairs::uniform(42);
    let mut mgr = ContextManager::new(&params, &schema, &topo, &qps).unwrap();
    mgr.create_collective_contexts(&mut CommandStream::new()).unwrap();
    mgr.register_comm(CommId(5)).unwrap();

    let mut stream = CommandStream::new();
    let required = base_required().with_remote_peers(0b110);
    let out = mgr
        .update_collective_context_scale_up(0, CommId(5), &required, &mut stream)
        .unwrap();
    assert_eq!(out.commands, 1);
    assert_eq!(stream.len(), 1);
    assert!(out.fields.contains(ContextFields::QUEUE_PAIRS | ContextFields::PORT_PEERS));

    let words = stream.command_dwords(0).unwrap();
    let header = ContextUpdateHeader::decode(&schema, words[0]);
    assert_eq!(header.fields, out.fields);
    assert_eq!(&words[1..], &[2, 0x8000, 0x11, 128, 0b110, 42]);

    let again = mgr
        .update_collective_context_scale_up(0, CommId(5), &required, &mut stream)
        .unwrap();
    assert!(again.fields.is_empty());
    assert_eq!(stream.len(), 1);
}

#[test]
fn oversized_update_changes_nothing() {
    // one hardware slot; a base update fits, a base update with a queue pair does not
    let params = HardwareParams {
        context_slot_capacity: 1,
        max_command_dwords: 6,
        ..Default::default()
    };
    let schema = CommandSchema::default();
    let topo = two_device_topology();
    let qps = FixedQueuePairs::uniform(9);
    let mut mgr = ContextManager::new(&params, &schema, &topo, &qps).unwrap();
    mgr.create_collective_contexts(&mut CommandStream::new()).unwrap();
    mgr.register_comm(CommId(0)).unwrap();
    mgr.register_comm(CommId(1)).unwrap();

    let mut stream = CommandStream::new();
    mgr.update_collective_context_scale_up(0, CommId(0), &base_required(), &mut stream)
        .unwrap();
    assert_eq!(stream.command_dwords(0).unwrap().len(), 5);

    let err = mgr
        .update_collective_context_scale_up(
            1,
            CommId(1),
            &base_required().with_remote_peers(1 << 1),
            &mut stream,
        )
        .unwrap_err();
    assert!(matches!(err, SyncError::Invariant { .. }));

    assert_eq!(stream.len(), 1);
    assert_eq!(mgr.lru().recency_order(), vec![CommId(0)]);
    assert_eq!(mgr.lru().slot_of(CommId(0)), Some(0));
    assert_eq!(mgr.lru().slot_of(CommId(1)), None);
    assert_eq!(mgr.lru_stats().evictions, 0);
    assert_eq!(mgr.context_state(0), Some(ContextState::Active(CommId(0))));
    assert_eq!(mgr.context_state(1), Some(ContextState::Unused));
    assert!(mgr.context(1).unwrap().comm_binding().is_none());
    assert!(!mgr.requires_lru_update(0, CommId(0)));
}
