mod common;

use std::sync::Arc;

use common::{block, counting_smgr, rnode, Calls};
use smgr::{
    BackendId, ForkNumber, RelationPrefix, RelFileNode, RelFileNodeBackend,
    StorageKind, XactOutcome,
};

#[test]
fn open_returns_the_cached_handle() {
    common::setup_logger();
    let (smgr, _storage) = counting_smgr();

    let a = smgr.open(rnode(1));
    let b = smgr.open(rnode(1));
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(smgr.stats().cached_relations, 1);
    assert_eq!(smgr.stats().unowned_relations, 1);

    // the temporary twin is a different object
    let temp = smgr.open(RelFileNodeBackend::temp(rnode(1).node, BackendId(4)));
    assert!(!Arc::ptr_eq(&a, &temp));
    assert!(temp.is_temp());
    assert_eq!(smgr.stats().cached_relations, 2);
}

#[test]
fn open_with_kind_detects_conflicts() {
    common::setup_logger();
    let (smgr, _storage) = counting_smgr();

    let heap = smgr.open(rnode(1));
    assert_eq!(heap.kind(), StorageKind::Heap);

    let err = smgr.open_with_kind(rnode(1), StorageKind::AoRows).unwrap_err();
    assert!(err.is_invalid_state());

    let ao = smgr.open_with_kind(rnode(2), StorageKind::AoColumns).unwrap();
    assert_eq!(ao.kind(), StorageKind::AoColumns);
    assert!(Arc::ptr_eq(&ao, &smgr.open(rnode(2))));
}

#[test]
fn closing_clears_the_owner_slot() {
    common::setup_logger();
    let (smgr, _storage) = counting_smgr();

    let slot = smgr.new_owner_slot();
    let rel = smgr.open(rnode(1));
    smgr.set_owner(slot, &rel).unwrap();

    assert!(rel.is_owned());
    assert!(Arc::ptr_eq(&smgr.owner(slot).unwrap(), &rel));
    assert_eq!(smgr.stats().unowned_relations, 0);

    smgr.close(&rel);
    assert!(smgr.owner(slot).is_none());
    assert!(rel.is_closed());
    assert!(!rel.is_owned());
    assert!(smgr.lookup(&rnode(1)).is_none());

    // closing again is harmless
    smgr.close(&rel);

    // the slot can be reused for a fresh handle
    let fresh = smgr.open(rnode(1));
    assert!(!Arc::ptr_eq(&fresh, &rel));
    smgr.set_owner(slot, &fresh).unwrap();
}

#[test]
fn owner_conflicts_are_rejected() {
    common::setup_logger();
    let (smgr, _storage) = counting_smgr();

    let slot = smgr.new_owner_slot();
    let a = smgr.open(rnode(1));
    let b = smgr.open(rnode(2));

    smgr.set_owner(slot, &a).unwrap();
    // same owner twice is fine
    smgr.set_owner(slot, &a).unwrap();
    assert!(smgr.set_owner(slot, &b).unwrap_err().is_invalid_state());

    smgr.release_owner_slot(slot);
    assert!(smgr.set_owner(slot, &b).unwrap_err().is_invalid_state());

    let closed = smgr.open(rnode(3));
    smgr.close(&closed);
    let other = smgr.new_owner_slot();
    assert!(smgr.set_owner(other, &closed).unwrap_err().is_invalid_state());
}

#[test]
fn ownership_moves_between_slots() {
    common::setup_logger();
    let (smgr, _storage) = counting_smgr();

    let first = smgr.new_owner_slot();
    let second = smgr.new_owner_slot();
    let rel = smgr.open(rnode(1));

    smgr.set_owner(first, &rel).unwrap();
    smgr.set_owner(second, &rel).unwrap();

    assert!(smgr.owner(first).is_none());
    assert!(Arc::ptr_eq(&smgr.owner(second).unwrap(), &rel));
    assert_eq!(rel.owner(), Some(second));

    // clearing through the wrong slot does nothing
    smgr.clear_owner(first, &rel);
    assert!(rel.is_owned());

    smgr.clear_owner(second, &rel);
    assert!(!rel.is_owned());
    assert!(!rel.is_closed());
    assert_eq!(smgr.stats().unowned_relations, 1);
}

#[test]
fn end_of_transaction_closes_unowned_handles() {
    common::setup_logger();
    let (smgr, _storage) = counting_smgr();

    let slot = smgr.new_owner_slot();
    let owned = smgr.open(rnode(1));
    smgr.set_owner(slot, &owned).unwrap();
    let unowned = smgr.open(rnode(2));

    let report = smgr.at_end_of_xact(XactOutcome::Commit);
    assert!(report.is_clean());

    assert!(unowned.is_closed());
    assert!(smgr.lookup(&rnode(2)).is_none());
    assert!(!owned.is_closed());
    assert!(Arc::ptr_eq(&smgr.lookup(&rnode(1)).unwrap(), &owned));

    // once the owner lets go, the next sweep closes it
    smgr.release_owner_slot(slot);
    smgr.at_end_of_xact(XactOutcome::Abort);
    assert!(owned.is_closed());
    assert_eq!(smgr.stats().cached_relations, 0);
}

#[test]
fn closed_handles_refuse_io() {
    common::setup_logger();
    let (smgr, _storage) = counting_smgr();

    let rel = smgr.open(rnode(1));
    smgr.create(&rel, ForkNumber::Main, false).unwrap();
    smgr.extend(&rel, ForkNumber::Main, 0, &block(1), false).unwrap();
    assert_eq!(rel.open_file_count(), 1);

    smgr.close(&rel);
    assert_eq!(rel.open_file_count(), 0);

    let mut buf = block(0);
    let err = smgr.read(&rel, ForkNumber::Main, 0, &mut buf).unwrap_err();
    assert!(err.is_invalid_state());

    // reopening finds the data again
    let rel = smgr.open(rnode(1));
    smgr.read(&rel, ForkNumber::Main, 0, &mut buf).unwrap();
    assert_eq!(buf, block(1));
}

#[test]
fn close_matching_prefixes() {
    common::setup_logger();
    let (smgr, _storage) = counting_smgr();

    let other_db = RelFileNodeBackend::permanent(RelFileNode::new(
        smgr::DEFAULT_TABLESPACE_OID,
        2,
        10,
    ));
    let temp = RelFileNodeBackend::temp(rnode(10).node, BackendId(1));

    for id in [rnode(10), rnode(11), other_db, temp] {
        smgr.open(id);
    }

    smgr.close_matching(RelationPrefix::Relation(rnode(10).node));
    assert!(smgr.lookup(&rnode(10)).is_none());
    assert!(smgr.lookup(&temp).is_none());
    assert!(smgr.lookup(&rnode(11)).is_some());

    smgr.close_matching(RelationPrefix::Database(1));
    assert!(smgr.lookup(&rnode(11)).is_none());
    assert!(smgr.lookup(&other_db).is_some());

    smgr.close_node(&other_db);
    assert_eq!(smgr.stats().cached_relations, 0);

    smgr.open(rnode(12));
    smgr.close_all();
    assert_eq!(smgr.stats().cached_relations, 0);
}

#[test]
fn invalidation_costs_exactly_one_requery() {
    common::setup_logger();
    let (smgr, storage) = counting_smgr();

    let rel = smgr.open(rnode(1));
    smgr.create(&rel, ForkNumber::Main, false).unwrap();
    for blkno in 0..3 {
        smgr.extend(&rel, ForkNumber::Main, blkno, &block(1), false).unwrap();
    }
    let before = Calls::get(&storage.calls.nblocks);

    assert_eq!(smgr.nblocks(&rel, ForkNumber::Main).unwrap(), 3);
    assert_eq!(Calls::get(&storage.calls.nblocks), before);

    rel.set_target_block(Some(2));
    smgr.invalidate(&rel);
    assert_eq!(rel.cached_nblocks(ForkNumber::Main), None);
    assert_eq!(rel.target_block(), None);

    assert_eq!(smgr.nblocks(&rel, ForkNumber::Main).unwrap(), 3);
    assert_eq!(smgr.nblocks(&rel, ForkNumber::Main).unwrap(), 3);
    assert_eq!(Calls::get(&storage.calls.nblocks), before + 1);
}
