//! OBLIVION - Integration Tests
//! End-to-end tests of the partition engine:
//! range tombstone invariants → reversible merge → compaction → difference → engine.

use std::cmp::Ordering;

use oblivion_partition::config::Config;
use oblivion_partition::engine::arena::Arena;
use oblivion_partition::engine::cell::{AtomicCell, CellValue, CollectionMutation, RowMarker};
use oblivion_partition::engine::compaction::{AlwaysGc, NeverGc, PurgeBelow};
use oblivion_partition::engine::partition::MutationPartition;
use oblivion_partition::engine::query::{PartitionSlice, QueryResult};
use oblivion_partition::engine::range_tombstone::RangeTombstone;
use oblivion_partition::engine::range_tombstone_list::RangeTombstoneList;
use oblivion_partition::engine::Engine;
use oblivion_partition::error::PartitionError;
use oblivion_partition::keys::{prefix_equality_compare, ClusteringKeyPrefix, ClusteringRange};
use oblivion_partition::schema::{ColumnKind, ColumnType, Schema};
use oblivion_partition::tombstone::Tombstone;
use oblivion_partition::types::{int32, text};

mod common {
    use super::*;

    pub fn schema() -> Schema {
        Schema::builder("ks", "events")
            .with_column("pk", ColumnType::Blob, ColumnKind::PartitionKey)
            .with_column("ck", ColumnType::Int32, ColumnKind::ClusteringKey)
            .with_column("s", ColumnType::Text, ColumnKind::Static)
            .with_column("v", ColumnType::Int32, ColumnKind::Regular)
            .with_column("w", ColumnType::Text, ColumnKind::Regular)
            .with_column("tags", ColumnType::Set(Box::new(ColumnType::Text)), ColumnKind::Regular)
            .with_gc_grace_seconds(10)
            .build()
    }

    pub fn key(v: i32) -> ClusteringKeyPrefix {
        ClusteringKeyPrefix::from_i32s(&[v])
    }

    pub fn rt(start: i32, end: i32, ts: i64, deletion_time: i64) -> RangeTombstone {
        RangeTombstone::inclusive(key(start), key(end), Tombstone::new(ts, deletion_time))
    }

    fn random_cell(rng: &mut fastrand::Rng) -> AtomicCell {
        let ts = rng.i64(1..10);
        match rng.u8(0..4) {
            0 => AtomicCell::dead(ts, rng.i64(0..100)),
            1 => {
                let expiry = rng.i64(30..70);
                AtomicCell::live_expiring(ts, int32(rng.i32(0..5)), expiry, rng.i64(0..20))
            }
            _ => AtomicCell::live(ts, int32(rng.i32(0..5))),
        }
    }

    fn random_marker(rng: &mut fastrand::Rng) -> RowMarker {
        let ts = rng.i64(1..10);
        match rng.u8(0..3) {
            0 => RowMarker::dead(ts, rng.i64(0..100)),
            1 => RowMarker::expiring(ts, rng.i64(30..70), rng.i64(0..20)),
            _ => RowMarker::live(ts),
        }
    }

    /// A random fragment. Range tombstones and collections are optional so
    /// callers can keep to data with a canonical shape.
    pub fn random_partition(
        rng: &mut fastrand::Rng,
        s: &Schema,
        with_ranges: bool,
        with_collections: bool,
    ) -> MutationPartition {
        let mut p = MutationPartition::new();
        if rng.u8(0..4) == 0 {
            p.apply_tombstone(Tombstone::new(rng.i64(1..6), rng.i64(0..100)));
        }
        if rng.bool() {
            p.set_static_cell(s, 0, CellValue::Atomic(AtomicCell::live(rng.i64(1..10), text("s"))))
                .unwrap();
        }
        if with_ranges {
            for _ in 0..rng.usize(0..3) {
                let start = rng.i32(0..12);
                let end = start + rng.i32(0..4);
                p.apply_delete(s, rt(start, end, rng.i64(1..10), rng.i64(0..100)));
            }
        }
        for _ in 0..rng.usize(0..8) {
            let k = key(rng.i32(0..12));
            match rng.u8(0..5) {
                0 => p.apply_row_tombstone(s, k, Tombstone::new(rng.i64(1..10), rng.i64(0..100))),
                1 => p.apply_marker(s, k, random_marker(rng)),
                2 if with_collections => {
                    let set = ColumnType::Set(Box::new(ColumnType::Text));
                    let mut m = CollectionMutation::default();
                    for _ in 0..rng.usize(1..3) {
                        let elem = text(["a", "b", "c"][rng.usize(0..3)]);
                        m = m.with_cell(&set, elem, AtomicCell::live(rng.i64(1..10), text("")));
                    }
                    p.set_clustered_cell(s, k, 2, CellValue::Collection(m)).unwrap();
                }
                _ => {
                    let column = rng.u32(0..2);
                    let cell = match column {
                        0 => random_cell(rng),
                        _ => AtomicCell::live(rng.i64(1..10), text("w")),
                    };
                    p.set_clustered_cell(s, k, column, CellValue::Atomic(cell)).unwrap();
                }
            }
        }
        p
    }
}

use common::{key, rt, schema};

// =====================================================================
// Range tombstone list
// =====================================================================

#[test]
fn test_range_tombstones_never_overlap() {
    let s = schema();
    let mut rng = fastrand::Rng::with_seed(7);
    for _ in 0..100 {
        let mut list = RangeTombstoneList::new();
        for _ in 0..rng.usize(1..12) {
            let start = rng.i32(0..30);
            list.add(&s, rt(start, start + rng.i32(0..8), rng.i64(1..6), 0));
        }
        // Neighbours may share a boundary point, so ends and starts are
        // compared by prefix, not by bound position.
        let entries: Vec<_> = list.iter().collect();
        for w in entries.windows(2) {
            assert_ne!(
                prefix_equality_compare(&s, &w[0].end.prefix, &w[1].start.prefix),
                Ordering::Greater,
                "{} overlaps {}",
                w[0],
                w[1]
            );
            assert!(!(w[0].is_singular() && w[1].is_singular() && w[0].end.prefix == w[1].start.prefix));
        }
    }
}

#[test]
fn test_random_insertion_orders_agree() {
    let s = schema();
    let mut rng = fastrand::Rng::with_seed(0x2d1f);
    for _ in 0..500 {
        let mut input: Vec<_> = (0..rng.usize(2..6))
            .map(|_| {
                let start = rng.i32(0..10);
                rt(start, start + rng.i32(0..5), rng.i64(1..4), 0)
            })
            .collect();

        let mut forward = RangeTombstoneList::new();
        for r in &input {
            forward.add(&s, r.clone());
        }
        input.reverse();
        let mut backward = RangeTombstoneList::new();
        for r in &input {
            backward.add(&s, r.clone());
        }
        rng.shuffle(&mut input);
        let mut shuffled = RangeTombstoneList::new();
        for r in &input {
            shuffled.add(&s, r.clone());
        }

        assert_eq!(forward, backward, "input {:?}", input);
        assert_eq!(forward, shuffled, "input {:?}", input);
    }
}

#[test]
fn test_insertion_order_independence() {
    let s = schema();
    let input = [rt(1, 5, 3, 0), rt(7, 10, 2, 0), rt(10, 13, 1, 0)];
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    let mut expected = RangeTombstoneList::new();
    for rt in &input {
        expected.add(&s, rt.clone());
    }
    assert_eq!(expected.len(), 3);
    for order in orders {
        let mut list = RangeTombstoneList::new();
        for i in order {
            list.add(&s, input[i].clone());
        }
        assert_eq!(list, expected, "order {:?}", order);
    }
}

#[test]
fn test_overwrite_and_duplicate_points() {
    let s = schema();
    let mut list = RangeTombstoneList::new();
    list.add(&s, rt(0, 10, 3, 0));
    list.add(&s, rt(3, 7, 5, 0));
    let ts: Vec<_> = list.iter().map(|e| e.tomb.timestamp).collect();
    assert_eq!(ts, vec![3, 5, 3]);

    let mut list = RangeTombstoneList::new();
    list.add(&s, rt(0, 10, 3, 0));
    list.add(&s, rt(3, 7, 2, 0));
    assert_eq!(list.len(), 1);

    let mut list = RangeTombstoneList::new();
    list.add(&s, rt(4, 4, 5, 0));
    list.add(&s, rt(4, 4, 6, 0));
    list.add(&s, rt(4, 4, 4, 0));
    assert_eq!(list.len(), 1);
    assert_eq!(list.iter().next().unwrap().tomb.timestamp, 6);
}

#[test]
fn test_covering_search() {
    let s = schema();
    let mut list = RangeTombstoneList::new();
    list.add(&s, rt(11, 12, 2, 0));
    list.add(&s, rt(1, 4, 2, 0));
    list.add(&s, rt(4, 10, 5, 0));
    assert_eq!(list.search_tombstone_covering(&s, &key(3)).timestamp, 2);
    assert_eq!(list.search_tombstone_covering(&s, &key(4)).timestamp, 5);
    assert_eq!(list.search_tombstone_covering(&s, &key(8)).timestamp, 5);
    assert_eq!(list.len(), 3);
}

// =====================================================================
// Reversible merge
// =====================================================================

fn rich_pair(s: &Schema) -> (MutationPartition, MutationPartition) {
    let set = ColumnType::Set(Box::new(ColumnType::Text));

    let mut dst = MutationPartition::new();
    dst.apply_tombstone(Tombstone::new(1, 10));
    dst.set_static_cell(s, 0, CellValue::Atomic(AtomicCell::live(2, text("old"))))
        .unwrap();
    dst.apply_delete(s, rt(0, 10, 3, 10));
    dst.set_clustered_cell(s, key(2), 0, CellValue::Atomic(AtomicCell::live(4, int32(2))))
        .unwrap();
    dst.set_clustered_cell(
        s,
        key(4),
        2,
        CellValue::Collection(CollectionMutation::default().with_cell(&set, text("a"), AtomicCell::live(4, text("")))),
    )
    .unwrap();
    dst.apply_insert(s, key(6), 4);

    let mut src = MutationPartition::new();
    src.apply_tombstone(Tombstone::new(2, 20));
    src.set_static_cell(s, 0, CellValue::Atomic(AtomicCell::live(5, text("new"))))
        .unwrap();
    src.apply_delete(s, rt(5, 15, 6, 20));
    src.apply_delete(s, rt(20, 25, 1, 20));
    src.set_clustered_cell(s, key(1), 0, CellValue::Atomic(AtomicCell::live(7, int32(1))))
        .unwrap();
    src.set_clustered_cell(s, key(2), 0, CellValue::Atomic(AtomicCell::dead(8, 30)))
        .unwrap();
    src.set_clustered_cell(s, key(2), 1, CellValue::Atomic(AtomicCell::live(8, text("x"))))
        .unwrap();
    src.set_clustered_cell(
        s,
        key(4),
        2,
        CellValue::Collection(CollectionMutation::default().with_cell(&set, text("b"), AtomicCell::live(7, text("")))),
    )
    .unwrap();
    src.apply_row_tombstone(s, key(6), Tombstone::new(9, 30));
    src.apply_marker(s, key(8), RowMarker::expiring(7, 100, 50));
    src.apply_insert(s, key(30), 7);

    (dst, src)
}

fn charges_needed(s: &Schema, dst: &MutationPartition, src: &MutationPartition) -> (usize, MutationPartition) {
    let mut merged = dst.clone();
    let mut arena = Arena::unbounded();
    merged.apply_in(s, src.clone(), &mut arena).unwrap();
    (arena.allocated(), merged)
}

fn assert_failure_at_every_step(s: &Schema, dst: &MutationPartition, src: &MutationPartition) {
    let (needed, expected) = charges_needed(s, dst, src);
    for limit in 0..needed {
        let mut target = dst.clone();
        let mut arena = Arena::with_limit(limit);
        let result = target.apply_in(s, src.clone(), &mut arena);
        assert!(
            matches!(result, Err(PartitionError::AllocationFailure(_))),
            "limit {} of {}",
            limit,
            needed
        );
        assert_eq!(&target, dst, "state changed after failure at {} of {}", limit, needed);
    }
    let mut target = dst.clone();
    let mut arena = Arena::with_limit(needed);
    target.apply_in(s, src.clone(), &mut arena).unwrap();
    assert_eq!(target, expected);
}

#[test]
fn test_failed_merge_leaves_destination_untouched() {
    let s = schema();
    let (dst, src) = rich_pair(&s);
    let (needed, _) = charges_needed(&s, &dst, &src);
    assert!(needed >= 10);
    assert_failure_at_every_step(&s, &dst, &src);
}

#[test]
fn test_failed_merge_random() {
    let s = schema();
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    for _ in 0..40 {
        let dst = common::random_partition(&mut rng, &s, true, true);
        let src = common::random_partition(&mut rng, &s, true, true);
        assert_failure_at_every_step(&s, &dst, &src);
    }
}

#[test]
fn test_merge_is_idempotent_and_commutative() {
    let s = schema();
    let mut rng = fastrand::Rng::with_seed(99);
    for _ in 0..50 {
        let a = common::random_partition(&mut rng, &s, false, false);
        let b = common::random_partition(&mut rng, &s, false, false);

        let mut ab = a.clone();
        ab.apply(&s, b.clone()).unwrap();
        let mut ba = b.clone();
        ba.apply(&s, a.clone()).unwrap();
        assert_eq!(ab, ba);

        let mut twice = ab.clone();
        twice.apply(&s, b).unwrap();
        assert_eq!(twice, ab);
    }
}

#[test]
fn test_merged_tombstones_shadow_rows() {
    let s = schema();
    let (mut dst, src) = rich_pair(&s);
    dst.apply(&s, src).unwrap();

    assert_eq!(dst.partition_tombstone(), Tombstone::new(2, 20));
    assert_eq!(dst.tombstone_for_row(&s, &key(2)).timestamp, 3);
    assert_eq!(dst.tombstone_for_row(&s, &key(6)).timestamp, 9);
    assert_eq!(dst.tombstone_for_row(&s, &key(12)).timestamp, 6);
    assert_eq!(dst.tombstone_for_row(&s, &key(18)).timestamp, 2);
    // Row 2 holds a dead v and a live w.
    assert_eq!(dst.live_row_count(&s, 0), 5);
}

// =====================================================================
// Compaction
// =====================================================================

#[test]
fn test_compaction_is_idempotent() {
    let s = schema();
    let mut rng = fastrand::Rng::with_seed(42);
    for _ in 0..100 {
        let mut p = common::random_partition(&mut rng, &s, true, true);
        let other = common::random_partition(&mut rng, &s, true, true);
        p.apply(&s, other).unwrap();
        let now = rng.i64(20..120);

        let mut once = p.clone();
        once.compact_for_compaction(&s, &AlwaysGc, now);
        let mut twice = once.clone();
        twice.compact_for_compaction(&s, &AlwaysGc, now);
        assert_eq!(once, twice, "compaction at {} not idempotent", now);

        // Compaction never changes what a read sees.
        assert_eq!(p.live_row_count(&s, now), once.live_row_count(&s, now));
    }
}

#[test]
fn test_gc_policy_controls_purging() {
    let s = schema();
    let mut p = MutationPartition::new();
    p.apply_delete(&s, rt(0, 5, 3, 10));
    p.apply_delete(&s, rt(6, 9, 8, 10));
    p.apply_row_tombstone(&s, key(20), Tombstone::new(4, 10));

    let mut kept = p.clone();
    kept.compact_for_compaction(&s, &NeverGc, 1000);
    assert_eq!(kept, p);

    let mut partial = p.clone();
    partial.compact_for_compaction(&s, &PurgeBelow::new(5), 1000);
    assert_eq!(partial.row_tombstones().len(), 1);
    assert!(partial.find_row(&s, &key(20)).is_none());

    // Inside the grace period nothing is purgeable.
    let mut young = p.clone();
    young.compact_for_compaction(&s, &AlwaysGc, 15);
    assert_eq!(young, p);
}

#[test]
fn test_query_compaction_limits_and_ranges() {
    let s = schema();
    let mut p = MutationPartition::new();
    for k in 0..10 {
        p.set_clustered_cell(&s, key(k), 0, CellValue::Atomic(AtomicCell::live(1, int32(k))))
            .unwrap();
    }
    p.apply_delete(&s, rt(3, 4, 5, 50));

    let ranges = [ClusteringRange::new(
        Some(oblivion_partition::keys::Bound::incl_start(key(2))),
        Some(oblivion_partition::keys::Bound::excl_end(key(8))),
    )];
    let mut q = p.clone();
    assert_eq!(q.compact_for_query(&s, 50, &ranges, false, 3), 3);
    let keys: Vec<_> = q.rows().iter().map(|e| e.key.clone()).collect();
    assert_eq!(keys, vec![key(2), key(5), key(6)]);
    // The range tombstone is kept: it is younger than the GC horizon.
    assert_eq!(q.row_tombstones().len(), 1);
}

// =====================================================================
// Difference
// =====================================================================

#[test]
fn test_difference_completes_merge() {
    let s = schema();
    let mut rng = fastrand::Rng::with_seed(1234);
    for _ in 0..100 {
        let a = common::random_partition(&mut rng, &s, false, false);
        let b = common::random_partition(&mut rng, &s, false, false);

        let mut ab = a.clone();
        ab.apply(&s, b.clone()).unwrap();

        let diff = a.difference(&s, &b).unwrap();
        let mut rebuilt = b.clone();
        rebuilt.apply(&s, diff).unwrap();
        assert_eq!(rebuilt, ab);
    }
}

#[test]
fn test_difference_restores_disjoint_fragment() {
    let s = schema();
    let mut a = MutationPartition::new();
    a.apply_tombstone(Tombstone::new(1, 5));
    a.apply_delete(&s, rt(0, 3, 4, 5));
    a.apply_delete(&s, rt(10, 12, 2, 5));
    for k in [0, 2, 4] {
        a.set_clustered_cell(&s, key(k), 0, CellValue::Atomic(AtomicCell::live(5, int32(k))))
            .unwrap();
    }
    let mut b = MutationPartition::new();
    for k in [1, 3, 5] {
        b.set_clustered_cell(&s, key(k), 1, CellValue::Atomic(AtomicCell::live(6, text("b"))))
            .unwrap();
    }
    b.apply_insert(&s, key(7), 6);

    let mut ab = a.clone();
    ab.apply(&s, b.clone()).unwrap();
    assert_eq!(ab.difference(&s, &b).unwrap(), a);
    assert!(b.difference(&s, &ab).unwrap().is_empty());
}

// =====================================================================
// Engine
// =====================================================================

fn engine_with_rows(rows: &[(&str, i32)]) -> Engine {
    let s = schema();
    let mut engine = Engine::open(s.clone(), Config::new(10)).unwrap();
    for (pk, ck) in rows {
        let mut f = MutationPartition::new();
        f.set_clustered_cell(&s, key(*ck), 0, CellValue::Atomic(AtomicCell::live(1, int32(*ck))))
            .unwrap();
        engine.apply(pk.as_bytes().to_vec(), f).unwrap();
    }
    engine
}

#[test]
fn test_engine_query_limits() {
    let engine = engine_with_rows(&[("a", 1), ("a", 2), ("b", 1), ("c", 1), ("c", 2)]);
    let slice = PartitionSlice::full(engine.schema());

    let all = engine.query(&slice, 100);
    assert_eq!(all.row_count, 5);
    assert_eq!(all.partition_count(), 3);

    let limited = engine.query_with_limits(&slice, 100, 3, u32::MAX);
    assert_eq!(limited.row_count, 3);
    assert_eq!(limited.partition_count(), 2);

    let by_partition = engine.query_with_limits(&slice, 100, u32::MAX, 2);
    assert_eq!(by_partition.partition_count(), 2);

    let bytes = all.to_bytes().unwrap();
    assert_eq!(QueryResult::from_bytes(&bytes).unwrap(), all);
}

#[test]
fn test_engine_reads_single_partition() {
    let engine = engine_with_rows(&[("a", 1), ("a", 2), ("b", 7)]);
    let slice = PartitionSlice::full(engine.schema());

    let result = engine.query_partition(b"a", &slice, 100);
    assert_eq!(result.partition_count(), 1);
    assert_eq!(result.row_count, 2);
    assert_eq!(result.partitions[0].key, b"a".to_vec());

    let restricted = slice.with_ranges(vec![ClusteringRange::singular(key(7))]);
    let result = engine.query_partition(b"b", &restricted, 100);
    assert_eq!(result.row_count, 1);
    assert_eq!(result.partitions[0].rows[0].key, Some(key(7)));

    let missing = engine.query_partition(b"missing", &PartitionSlice::full(engine.schema()), 100);
    assert_eq!(missing.partition_count(), 0);
    assert_eq!(
        engine
            .metrics()
            .queries
            .load(std::sync::atomic::Ordering::Relaxed),
        3
    );
}

#[test]
fn test_engine_rollback_is_counted() {
    let s = schema();
    let config = Config::new(10).with_arena_limit(1);
    let mut engine = Engine::open(s.clone(), config).unwrap();

    let mut f = MutationPartition::new();
    f.set_clustered_cell(&s, key(1), 0, CellValue::Atomic(AtomicCell::live(1, int32(1))))
        .unwrap();
    f.set_clustered_cell(&s, key(2), 0, CellValue::Atomic(AtomicCell::live(1, int32(2))))
        .unwrap();
    assert!(engine.apply(b"k".to_vec(), f).is_err());
    assert!(engine.is_empty());
    assert_eq!(
        engine
            .metrics()
            .rollbacks
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn test_engine_upgrades_old_fragments() {
    let old = Schema::builder("ks", "events")
        .with_column("pk", ColumnType::Blob, ColumnKind::PartitionKey)
        .with_column("ck", ColumnType::Int32, ColumnKind::ClusteringKey)
        .with_column("gone", ColumnType::Int32, ColumnKind::Regular)
        .with_column("w", ColumnType::Text, ColumnKind::Regular)
        .build();
    let mut engine = Engine::open(schema(), Config::new(10)).unwrap();

    let mut f = MutationPartition::new();
    f.set_clustered_cell(&old, key(1), 0, CellValue::Atomic(AtomicCell::live(1, int32(9))))
        .unwrap();
    f.set_clustered_cell(&old, key(1), 1, CellValue::Atomic(AtomicCell::live(1, text("kept"))))
        .unwrap();
    engine.apply_with_schema(b"k".to_vec(), f, &old).unwrap();

    let p = engine.get(b"k").unwrap();
    let row = p.find_row(engine.schema(), &key(1)).unwrap();
    assert_eq!(row.cells.len(), 1);
    assert_eq!(
        row.cells.find_cell(1),
        Some(&CellValue::Atomic(AtomicCell::live(1, text("kept"))))
    );
    assert_eq!(
        engine
            .metrics()
            .upgrades
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn test_engine_compaction_drops_dead_partitions() {
    let s = schema();
    let mut engine = engine_with_rows(&[("a", 1), ("b", 1)]);
    let mut delete = MutationPartition::new();
    delete.apply_tombstone(Tombstone::new(5, 20));
    engine.apply(b"b".to_vec(), delete).unwrap();

    assert_eq!(engine.compact(&AlwaysGc, 25), 0);
    assert_eq!(engine.get(b"b").unwrap().partition_tombstone(), Tombstone::new(5, 20));
    assert_eq!(engine.compact(&AlwaysGc, 31), 1);
    assert_eq!(engine.len(), 1);
    assert!(engine.get(b"a").unwrap().find_row(&s, &key(1)).is_some());
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = Engine::open(schema(), Config::default().with_row_limit(0));
    assert!(matches!(result, Err(PartitionError::Config(_))));
}
