mod common;

use common::{create_table, fill, fill_segment, mem_catalog};
use flintmeta::error::Error;
use flintmeta::storage::{LogEntryType, LogIndex, Op};

#[test]
fn test_upgrade_full_segment_then_sealed() {
    let (store, catalog) = mem_catalog();
    let table = create_table(&catalog, "events", 2, 8);
    let seg = table.create_segment(&catalog, 2, None, true).unwrap();
    let b1 = seg.create_block(&catalog, 3, None, true).unwrap();
    fill(&b1);
    let b2 = seg.create_block(&catalog, 4, None, true).unwrap();
    fill(&b2);

    seg.upgrade(&catalog, 10, None, true).unwrap();
    assert_eq!(seg.current().op, Op::UpgradeSorted);
    assert_eq!(seg.current().commit_id, 10);

    assert!(matches!(
        seg.create_block(&catalog, 11, None, true),
        Err(Error::SegmentFull { .. })
    ));
    assert!(matches!(
        seg.upgrade(&catalog, 11, None, true),
        Err(Error::UpgradeNotNeeded { kind: "segment", .. })
    ));

    let upgrades = store
        .entries()
        .iter()
        .filter(|e| e.entry_type().unwrap() == LogEntryType::UpgradeSegment)
        .count();
    assert_eq!(upgrades, 1);
}

#[test]
fn test_one_full_block_of_three_is_infull() {
    let (_store, catalog) = mem_catalog();
    let table = create_table(&catalog, "events", 3, 8);
    let seg = table.simple_create_segment(&catalog, None).unwrap();
    fill_segment(&catalog, &seg, 1);

    let err = seg.simple_upgrade(&catalog, None).unwrap_err();
    assert!(matches!(err, Error::UpgradeInfullSegment { .. }));
    assert!(!err.is_fatal());
    assert_eq!(seg.base().chain().len(), 1);
}

#[test]
fn test_block_append_respects_capacity() {
    let (_store, catalog) = mem_catalog();
    let table = create_table(&catalog, "events", 2, 10);
    let seg = table.simple_create_segment(&catalog, None).unwrap();
    let blk = seg.simple_create_block(&catalog, None).unwrap();

    assert_eq!(blk.add_rows(6).unwrap(), 6);
    assert!(matches!(
        blk.add_rows(5),
        Err(Error::CapacityExceeded { requested: 5, .. })
    ));
    assert_eq!(blk.row_count(), 6);
    assert!(matches!(
        blk.simple_upgrade(&catalog, None),
        Err(Error::UpgradeInfullBlock { .. })
    ));

    blk.add_rows(4).unwrap();
    assert!(blk.is_full());
    assert!(matches!(blk.add_rows(1), Err(Error::CapacityExceeded { .. })));
    blk.simple_upgrade(&catalog, Some(LogIndex::new(3))).unwrap();
    assert_eq!(blk.get_applied_index(), Some(3));
}

#[test]
fn test_committed_view_matches_creation_commits() {
    let (_store, catalog) = mem_catalog();
    let table = catalog
        .create_table(flintmeta::Schema::new("events", 4, 2), 1, true)
        .unwrap();
    let seg = table.create_segment(&catalog, 5, None, true).unwrap();
    let created: Vec<_> = [6, 9, 14]
        .into_iter()
        .map(|tran| (tran, seg.create_block(&catalog, tran, None, true).unwrap().id()))
        .collect();

    assert!(seg.committed_view(4).is_none());
    for commit_id in 5..16 {
        let view = seg.committed_view(commit_id).unwrap();
        let expected: Vec<_> = created
            .iter()
            .filter(|(tran, _)| *tran <= commit_id)
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(view.block_ids(), expected, "as of {}", commit_id);
    }
}

#[test]
fn test_committed_view_keeps_old_versions() {
    let (_store, catalog) = mem_catalog();
    let table = catalog
        .create_table(flintmeta::Schema::new("events", 1, 2), 1, true)
        .unwrap();
    let seg = table.create_segment(&catalog, 2, None, true).unwrap();
    let blk = seg.create_block(&catalog, 3, None, true).unwrap();
    fill(&blk);
    blk.upgrade(&catalog, 4, None, true).unwrap();
    seg.upgrade(&catalog, 5, None, true).unwrap();

    let before = seg.committed_view(4).unwrap();
    assert_eq!(before.base.current().op, Op::Create);
    assert_eq!(before.blocks[0].base.current().op, Op::UpgradeFull);

    let at_create = seg.committed_view(3).unwrap();
    assert_eq!(at_create.blocks[0].base.current().op, Op::Create);

    let after = seg.committed_view(5).unwrap();
    assert_eq!(after.base.current().op, Op::UpgradeSorted);
}

#[test]
fn test_drop_block_requires_soft_delete() {
    let (store, catalog) = mem_catalog();
    let table = create_table(&catalog, "events", 2, 2);
    let seg = table.simple_create_segment(&catalog, None).unwrap();
    let blk = seg.simple_create_block(&catalog, None).unwrap();

    assert!(matches!(
        blk.to_log_entry(LogEntryType::DropBlock),
        Err(Error::InvariantViolation(_))
    ));
    let logged = store.len();
    blk.soft_delete(&catalog, catalog.next_uncommitted_id(), true).unwrap();
    assert_eq!(store.len(), logged + 1);
    assert!(blk.is_soft_deleted());
}

#[test]
fn test_table_rolls_over_to_new_segment() {
    let (_store, catalog) = mem_catalog();
    let table = create_table(&catalog, "events", 2, 4);
    let mut blocks = Vec::new();
    for _ in 0..5 {
        let seg = table.appendable_segment(&catalog).unwrap();
        let blk = seg.next_appendable_block(&catalog).unwrap().unwrap();
        fill(&blk);
        blocks.push(blk);
    }
    assert_eq!(table.segment_count(), 3);
    let segs = table.segments();
    assert_eq!(segs[0].block_count(), 2);
    assert_eq!(segs[2].block_count(), 1);
    assert!(segs[0].has_max_blocks());
    segs[0].simple_upgrade(&catalog, None).unwrap();
    assert!(segs[0].is_sorted());
}
