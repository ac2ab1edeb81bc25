//! End-to-end integration cycles: queue, sequence, rehash, sign-root,
//! prove. Runs against the in-memory backend.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use merklelog::crypto::{LogHasher, Rfc6962Hasher};
use merklelog::domain::{QueueStatus, TreeId};
use merklelog::infra::{
    LogStorage, MasterSignal, MemoryAdmin, NoopMaster, RetryConfig,
};
use merklelog::merkle::proof;
use merklelog::sequencer::{self, IntegrateOptions};

use common::{leaf, Harness};

const NOW: i64 = 1_000_000_000;

async fn init(harness: &Harness, meta: &merklelog::domain::TreeMeta) {
    sequencer::init_tree(&*harness.storage, meta, &Rfc6962Hasher, NOW)
        .await
        .unwrap();
}

async fn integrate(harness: &Harness, meta: &merklelog::domain::TreeMeta, now: i64) -> u64 {
    let mut tx = harness.storage.begin_for_tree(meta).await.unwrap();
    let summary = match meta.tree_type {
        merklelog::domain::TreeType::Log => {
            sequencer::integrate_batch(&mut *tx, &Rfc6962Hasher, &IntegrateOptions::default(), now)
                .await
                .unwrap()
        }
        merklelog::domain::TreeType::PreorderedLog => sequencer::integrate_preordered(
            &mut *tx,
            &Rfc6962Hasher,
            &IntegrateOptions::default(),
            now,
        )
        .await
        .unwrap(),
    };
    tx.commit().await.unwrap();
    summary.leaves_integrated
}

async fn latest_root(
    harness: &Harness,
    meta: &merklelog::domain::TreeMeta,
) -> merklelog::domain::SignedLogRoot {
    let mut snapshot = harness.storage.snapshot_for_tree(meta).await.unwrap();
    let root = snapshot.latest_signed_log_root().await.unwrap();
    snapshot.close().await.unwrap();
    root
}

#[tokio::test]
async fn single_leaf_integration_produces_the_leaf_hash_root() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(17);
    init(&harness, &meta).await;

    harness
        .storage
        .queue_leaves(&meta, vec![leaf("a")], 1000)
        .await
        .unwrap();
    assert_eq!(integrate(&harness, &meta, NOW + 7).await, 1);

    let root = latest_root(&harness, &meta).await;
    assert_eq!(root.tree_size(), 1);
    assert_eq!(*root.root_hash(), Rfc6962Hasher.hash_leaf(b"a"));
    // One committed transaction for the empty root, one for the batch.
    assert_eq!(root.root.revision, 2);

    let mut snapshot = harness.storage.snapshot_for_tree(&meta).await.unwrap();
    let stored = snapshot.get_leaves_by_range(0, 1).await.unwrap();
    snapshot.close().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].leaf_index, 0);
    assert_eq!(stored[0].queue_timestamp_nanos, 1000);
    assert_eq!(stored[0].integrate_timestamp_nanos, NOW + 7);
}

#[tokio::test]
async fn one_batch_integrates_two_leaves_in_fifo_order() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(1);
    init(&harness, &meta).await;

    harness
        .storage
        .queue_leaves(&meta, vec![leaf("a")], 1000)
        .await
        .unwrap();
    harness
        .storage
        .queue_leaves(&meta, vec![leaf("b")], 1001)
        .await
        .unwrap();
    assert_eq!(integrate(&harness, &meta, NOW).await, 2);

    let hasher = Rfc6962Hasher;
    let expected = hasher.hash_children(&hasher.hash_leaf(b"a"), &hasher.hash_leaf(b"b"));
    let root = latest_root(&harness, &meta).await;
    assert_eq!(root.tree_size(), 2);
    assert_eq!(*root.root_hash(), expected);

    let mut snapshot = harness.storage.snapshot_for_tree(&meta).await.unwrap();
    let stored = snapshot.get_leaves_by_range(0, 2).await.unwrap();
    snapshot.close().await.unwrap();
    assert_eq!(stored[0].leaf_value, b"a");
    assert_eq!(stored[1].leaf_value, b"b");
}

#[tokio::test]
async fn duplicate_submissions_sequence_exactly_once() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(1);
    init(&harness, &meta).await;

    harness
        .storage
        .queue_leaves(&meta, vec![leaf("a")], 1000)
        .await
        .unwrap();
    assert_eq!(integrate(&harness, &meta, NOW).await, 1);

    // Resubmitting "a" surfaces the already-sequenced leaf.
    let queued = harness
        .storage
        .queue_leaves(&meta, vec![leaf("a"), leaf("b")], 2000)
        .await
        .unwrap();
    assert_eq!(queued[0].status, QueueStatus::AlreadyExists);
    assert_eq!(queued[0].leaf.leaf_index, 0);
    assert_eq!(queued[0].leaf.queue_timestamp_nanos, 1000);
    assert_eq!(queued[1].status, QueueStatus::Ok);

    assert_eq!(integrate(&harness, &meta, NOW + 1).await, 1);
    let root = latest_root(&harness, &meta).await;
    assert_eq!(root.tree_size(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_writers_fill_two_indices_exactly_once() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(17);
    init(&harness, &meta).await;

    let admin = Arc::new(MemoryAdmin::new());
    admin.upsert_tree(meta.clone()).await;

    let mut handles = Vec::new();
    for (task, value) in ["first", "second"].iter().enumerate() {
        let storage = Arc::clone(&harness.storage);
        let admin = Arc::clone(&admin);
        let meta = meta.clone();
        handles.push(tokio::spawn(async move {
            storage
                .queue_leaves(&meta, vec![leaf(value)], 1000 + task as i64)
                .await
                .unwrap();
            sequencer::run_once(
                &*storage,
                &*admin,
                &NoopMaster,
                meta.id,
                &Rfc6962Hasher,
                &IntegrateOptions::default(),
                &RetryConfig::fast(),
                NOW + task as i64,
            )
            .await
            .unwrap()
        }));
    }
    let mut integrated = 0;
    for handle in handles {
        if let Some(summary) = handle.await.unwrap() {
            integrated += summary.leaves_integrated;
        }
    }
    assert_eq!(integrated, 2);

    let root = latest_root(&harness, &meta).await;
    assert_eq!(root.tree_size(), 2);

    let mut snapshot = harness.storage.snapshot_for_tree(&meta).await.unwrap();
    let stored = snapshot.get_leaves_by_range(0, 2).await.unwrap();
    snapshot.close().await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_ne!(stored[0].leaf_value, stored[1].leaf_value);
}

#[tokio::test]
async fn inclusion_proof_round_trips_against_the_signed_root() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(1);
    init(&harness, &meta).await;

    let leaves: Vec<_> = (0..5).map(|i| leaf(&i.to_string())).collect();
    harness
        .storage
        .queue_leaves(&meta, leaves, NOW)
        .await
        .unwrap();
    assert_eq!(integrate(&harness, &meta, NOW).await, 5);

    let root = latest_root(&harness, &meta).await;
    let mut snapshot = harness.storage.snapshot_for_tree(&meta).await.unwrap();
    let stored = snapshot.get_leaves_by_range(0, 5).await.unwrap();
    snapshot.close().await.unwrap();

    let hashes: Vec<_> = stored.iter().map(|l| l.merkle_leaf_hash).collect();
    let hasher = Rfc6962Hasher;
    let path = proof::inclusion_proof(&hasher, &hashes, 2).unwrap();
    assert!(proof::verify_inclusion(
        &hasher,
        &hashes[2],
        2,
        5,
        &path,
        root.root_hash()
    ));

    // The proof pins the leaf: any other value fails.
    assert!(!proof::verify_inclusion(
        &hasher,
        &hasher.hash_leaf(b"9"),
        2,
        5,
        &path,
        root.root_hash()
    ));
}

#[tokio::test]
async fn consistency_proof_links_successive_roots() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(1);
    init(&harness, &meta).await;

    harness
        .storage
        .queue_leaves(&meta, (0..3).map(|i| leaf(&format!("x{i}"))).collect(), NOW)
        .await
        .unwrap();
    integrate(&harness, &meta, NOW).await;
    let root_at_3 = latest_root(&harness, &meta).await;

    harness
        .storage
        .queue_leaves(&meta, (3..7).map(|i| leaf(&format!("x{i}"))).collect(), NOW)
        .await
        .unwrap();
    integrate(&harness, &meta, NOW + 1).await;
    let root_at_7 = latest_root(&harness, &meta).await;

    assert!(root_at_3.root.revision < root_at_7.root.revision);
    assert!(root_at_3.root.timestamp_nanos <= root_at_7.root.timestamp_nanos);

    let mut snapshot = harness.storage.snapshot_for_tree(&meta).await.unwrap();
    let stored = snapshot.get_leaves_by_range(0, 7).await.unwrap();
    snapshot.close().await.unwrap();
    let hashes: Vec<_> = stored.iter().map(|l| l.merkle_leaf_hash).collect();

    let hasher = Rfc6962Hasher;
    let path = proof::consistency_proof(&hasher, &hashes, 3).unwrap();
    assert!(proof::verify_consistency(
        &hasher,
        3,
        7,
        root_at_3.root_hash(),
        root_at_7.root_hash(),
        &path
    ));
}

#[tokio::test]
async fn preordered_integration_stops_at_gaps() {
    let harness = Harness::new();
    let meta = harness.add_preordered_tree(6);
    init(&harness, &meta).await;

    // Indices 0 and 2 arrive first; 1 is still missing.
    harness
        .storage
        .add_sequenced_leaves(
            &meta,
            vec![leaf("zero").with_index(0), leaf("two").with_index(2)],
            NOW,
        )
        .await
        .unwrap();
    assert_eq!(integrate(&harness, &meta, NOW).await, 1);
    assert_eq!(latest_root(&harness, &meta).await.tree_size(), 1);

    // Filling the gap lets the next cycle advance past it.
    harness
        .storage
        .add_sequenced_leaves(&meta, vec![leaf("one").with_index(1)], NOW + 1)
        .await
        .unwrap();
    assert_eq!(integrate(&harness, &meta, NOW + 2).await, 2);

    let root = latest_root(&harness, &meta).await;
    assert_eq!(root.tree_size(), 3);

    let hasher = Rfc6962Hasher;
    let expected = proof::root_hash(
        &hasher,
        &[
            hasher.hash_leaf(b"zero"),
            hasher.hash_leaf(b"one"),
            hasher.hash_leaf(b"two"),
        ],
    );
    assert_eq!(*root.root_hash(), expected);
}

#[tokio::test]
async fn preordered_duplicate_identity_is_reported_not_stored() {
    let harness = Harness::new();
    let meta = harness.add_preordered_tree(1);
    init(&harness, &meta).await;

    harness
        .storage
        .add_sequenced_leaves(&meta, vec![leaf("a").with_index(0)], NOW)
        .await
        .unwrap();
    let results = harness
        .storage
        .add_sequenced_leaves(&meta, vec![leaf("a").with_index(5)], NOW + 1)
        .await
        .unwrap();
    assert_eq!(results[0].status, QueueStatus::AlreadyExists);
    assert_eq!(results[0].leaf.leaf_index, 0);
}

#[tokio::test]
async fn idle_cycles_store_no_root() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(1);
    init(&harness, &meta).await;

    let before = latest_root(&harness, &meta).await;
    assert_eq!(integrate(&harness, &meta, NOW + 100).await, 0);
    let after = latest_root(&harness, &meta).await;

    assert_eq!(before, after);
}

#[tokio::test]
async fn guard_window_defers_fresh_leaves() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(1);
    init(&harness, &meta).await;

    harness
        .storage
        .queue_leaves(&meta, vec![leaf("fresh")], NOW - 10)
        .await
        .unwrap();

    let options = IntegrateOptions {
        guard_window_nanos: 100,
        ..Default::default()
    };
    let mut tx = harness.storage.begin_for_tree(&meta).await.unwrap();
    let summary = sequencer::integrate_batch(&mut *tx, &Rfc6962Hasher, &options, NOW)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(summary.leaves_integrated, 0);

    // Once the leaf ages past the window it integrates.
    let mut tx = harness.storage.begin_for_tree(&meta).await.unwrap();
    let summary = sequencer::integrate_batch(&mut *tx, &Rfc6962Hasher, &options, NOW + 200)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(summary.leaves_integrated, 1);
}

#[tokio::test]
async fn batch_limit_spreads_integration_across_cycles() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(1);
    init(&harness, &meta).await;

    harness
        .storage
        .queue_leaves(
            &meta,
            (0..13).map(|i| leaf(&format!("leaf-{i}"))).collect(),
            NOW,
        )
        .await
        .unwrap();

    let options = IntegrateOptions {
        batch_limit: 5,
        ..Default::default()
    };
    let mut sizes = Vec::new();
    for cycle in 0..3 {
        let mut tx = harness.storage.begin_for_tree(&meta).await.unwrap();
        let summary =
            sequencer::integrate_batch(&mut *tx, &Rfc6962Hasher, &options, NOW + cycle)
                .await
                .unwrap();
        tx.commit().await.unwrap();
        sizes.push(summary.tree_size);
    }
    assert_eq!(sizes, vec![5, 10, 13]);

    // The staged rehash across cycles matches a from-scratch computation.
    let root = latest_root(&harness, &meta).await;
    let mut snapshot = harness.storage.snapshot_for_tree(&meta).await.unwrap();
    let stored = snapshot.get_leaves_by_range(0, 13).await.unwrap();
    snapshot.close().await.unwrap();
    let hashes: Vec<_> = stored.iter().map(|l| l.merkle_leaf_hash).collect();
    assert_eq!(*root.root_hash(), proof::root_hash(&Rfc6962Hasher, &hashes));
}

/// A signal that never grants mastership.
struct NeverMaster;

#[async_trait]
impl MasterSignal for NeverMaster {
    async fn is_master(&self, _tree_id: TreeId) -> bool {
        false
    }

    async fn await_master(&self, _tree_id: TreeId) {
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn run_once_defers_to_the_master_signal() {
    let harness = Harness::new();
    let meta = harness.add_log_tree(1);
    init(&harness, &meta).await;

    let admin = MemoryAdmin::new();
    admin.upsert_tree(meta.clone()).await;

    harness
        .storage
        .queue_leaves(&meta, vec![leaf("a")], NOW)
        .await
        .unwrap();

    let skipped = sequencer::run_once(
        &*harness.storage,
        &admin,
        &NeverMaster,
        meta.id,
        &Rfc6962Hasher,
        &IntegrateOptions::default(),
        &RetryConfig::fast(),
        NOW,
    )
    .await
    .unwrap();
    assert!(skipped.is_none());
    assert_eq!(latest_root(&harness, &meta).await.tree_size(), 0);

    let ran = sequencer::run_once(
        &*harness.storage,
        &admin,
        &NoopMaster,
        meta.id,
        &Rfc6962Hasher,
        &IntegrateOptions::default(),
        &RetryConfig::fast(),
        NOW,
    )
    .await
    .unwrap();
    assert_eq!(ran.unwrap().tree_size, 1);
}

#[tokio::test]
async fn merkle_nodes_are_revisioned_per_snapshot() {
    use merklelog::merkle::CompactRange;

    let harness = Harness::new();
    let meta = harness.add_log_tree(1);
    init(&harness, &meta).await;

    harness
        .storage
        .queue_leaves(&meta, (0..3).map(|i| leaf(&format!("a{i}"))).collect(), NOW)
        .await
        .unwrap();
    integrate(&harness, &meta, NOW).await;
    let mut old_snapshot = harness.storage.snapshot_for_tree(&meta).await.unwrap();
    let old_root = old_snapshot.latest_signed_log_root().await.unwrap();

    harness
        .storage
        .queue_leaves(&meta, (3..7).map(|i| leaf(&format!("a{i}"))).collect(), NOW)
        .await
        .unwrap();
    integrate(&harness, &meta, NOW + 1).await;

    // The old snapshot reconstructs its own root from the node revisions it
    // pinned, untouched by the later commit.
    let old_ids = CompactRange::<Rfc6962Hasher>::node_ids_for_size(3);
    let old_nodes = old_snapshot.get_merkle_nodes(&old_ids).await.unwrap();
    let old_range = CompactRange::from_parts(Rfc6962Hasher, 3, &old_nodes).unwrap();
    assert_eq!(old_range.root(), *old_root.root_hash());
    old_snapshot.close().await.unwrap();

    // A fresh snapshot reconstructs the new root the same way.
    let mut new_snapshot = harness.storage.snapshot_for_tree(&meta).await.unwrap();
    let new_root = new_snapshot.latest_signed_log_root().await.unwrap();
    let new_ids = CompactRange::<Rfc6962Hasher>::node_ids_for_size(7);
    let new_nodes = new_snapshot.get_merkle_nodes(&new_ids).await.unwrap();
    let new_range = CompactRange::from_parts(Rfc6962Hasher, 7, &new_nodes).unwrap();
    assert_eq!(new_range.root(), *new_root.root_hash());
    new_snapshot.close().await.unwrap();
}

#[tokio::test]
async fn sweep_covers_every_active_tree_independently() {
    let harness = Harness::new();
    let log_tree = harness.add_log_tree(1);
    let preordered = harness.add_preordered_tree(2);
    // Registered but never initialised: its cycle fails without stopping
    // the sweep.
    let broken = harness.add_log_tree(3);

    init(&harness, &log_tree).await;
    init(&harness, &preordered).await;

    let admin = MemoryAdmin::new();
    for meta in [&log_tree, &preordered, &broken] {
        admin.upsert_tree((*meta).clone()).await;
    }

    harness
        .storage
        .queue_leaves(&log_tree, vec![leaf("a"), leaf("b")], NOW)
        .await
        .unwrap();
    harness
        .storage
        .add_sequenced_leaves(&preordered, vec![leaf("p").with_index(0)], NOW)
        .await
        .unwrap();

    let outcome = sequencer::run_all_once(
        &*harness.storage,
        &admin,
        &NoopMaster,
        &Rfc6962Hasher,
        &IntegrateOptions::default(),
        &RetryConfig::fast(),
        NOW + 1,
    )
    .await
    .unwrap();

    assert_eq!(outcome.integrated.len(), 2);
    let by_id: std::collections::HashMap<_, _> = outcome
        .integrated
        .iter()
        .map(|(id, summary)| (*id, summary.tree_size))
        .collect();
    assert_eq!(by_id[&log_tree.id], 2);
    assert_eq!(by_id[&preordered.id], 1);
    assert!(outcome.skipped.is_empty());
    assert_eq!(outcome.failed, vec![broken.id]);
}
