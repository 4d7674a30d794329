// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Randomized structural invariant checks for the reactive tree.
//!
//! Every operation sequence must leave the tree with:
//! - correct per-node visible counts,
//! - a chain that is a valid DFS of the visible forest, equal length
//!   forward and backward,
//! - null chain links on every off-chain node.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use trellis_core::{CompoundKey, Direction, EdgeId, KeyWriter, NodeId, ReactiveTree, Value};

const MAX_NODES: u64 = 40;

#[derive(Clone, Debug)]
enum Op {
    InsertRoot { sort: i64 },
    InsertChild { parent_slot: usize, edge: u8, sort: i64 },
    Remove { slot: usize },
    Expand { slot: usize, edge: u8 },
    Collapse { slot: usize, edge: u8 },
    UpdateKey { slot: usize, sort: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<i64>()).prop_map(|sort| Op::InsertRoot { sort }),
        (0..64_usize, 0..2_u8, any::<i64>())
            .prop_map(|(parent_slot, edge, sort)| Op::InsertChild { parent_slot, edge, sort }),
        (0..64_usize).prop_map(|slot| Op::Remove { slot }),
        (0..64_usize, 0..2_u8).prop_map(|(slot, edge)| Op::Expand { slot, edge }),
        (0..64_usize, 0..2_u8).prop_map(|(slot, edge)| Op::Collapse { slot, edge }),
        (0..64_usize, any::<i64>()).prop_map(|(slot, sort)| Op::UpdateKey { slot, sort }),
    ]
}

fn key_for(tree: &ReactiveTree, parent: Option<NodeId>, sort: i64, id: NodeId) -> CompoundKey {
    let prefix = parent
        .and_then(|p| tree.key(p).cloned())
        .unwrap_or_else(CompoundKey::empty);
    let mut w = KeyWriter::with_prefix(&prefix, 512);
    w.push_value(&Value::Int(sort), Direction::Asc);
    w.push_node_id(id);
    w.finish()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn random_op_sequences_preserve_every_invariant(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut tree = ReactiveTree::new();
        // Slot table: node ids with their parents, so random ops can
        // address live nodes.
        let mut live: Vec<(NodeId, Option<NodeId>)> = Vec::new();
        let mut next_id = 1_u64;

        for op in ops {
            match op {
                Op::InsertRoot { sort } => {
                    if next_id > MAX_NODES {
                        continue;
                    }
                    let id = NodeId::from_raw(next_id);
                    next_id += 1;
                    let key = key_for(&tree, None, sort, id);
                    tree.insert_root(id, key);
                    live.push((id, None));
                }
                Op::InsertChild { parent_slot, edge, sort } => {
                    if live.is_empty() || next_id > MAX_NODES {
                        continue;
                    }
                    let (parent, _) = live[parent_slot % live.len()];
                    let id = NodeId::from_raw(next_id);
                    next_id += 1;
                    let key = key_for(&tree, Some(parent), sort, id);
                    tree.insert_child(parent, EdgeId::from_raw(u32::from(edge)), id, key);
                    live.push((id, Some(parent)));
                }
                Op::Remove { slot } => {
                    if live.is_empty() {
                        continue;
                    }
                    let (id, parent) = live[slot % live.len()];
                    if parent.is_none() {
                        tree.remove_root(id);
                    } else {
                        tree.remove_child(id);
                    }
                    live.retain(|&(n, _)| tree.contains(n));
                }
                Op::Expand { slot, edge } => {
                    if live.is_empty() {
                        continue;
                    }
                    let (id, _) = live[slot % live.len()];
                    tree.expand(id, EdgeId::from_raw(u32::from(edge)));
                }
                Op::Collapse { slot, edge } => {
                    if live.is_empty() {
                        continue;
                    }
                    let (id, _) = live[slot % live.len()];
                    tree.collapse(id, EdgeId::from_raw(u32::from(edge)));
                }
                Op::UpdateKey { slot, sort } => {
                    if live.is_empty() {
                        continue;
                    }
                    let (id, parent) = live[slot % live.len()];
                    let key = key_for(&tree, parent, sort, id);
                    tree.update_key(id, key);
                }
            }
            prop_assert!(tree.validate().is_ok(), "{:?}", tree.validate());
        }

        // Expansion idempotence and round trip over whatever survived.
        for &(id, _) in &live {
            let edge = EdgeId::from_raw(0);
            tree.expand(id, edge);
            let expanded = tree.total_visible();
            tree.expand(id, edge);
            prop_assert_eq!(tree.total_visible(), expanded);
            tree.collapse(id, edge);
            let collapsed = tree.total_visible();
            prop_assert!(collapsed <= expanded);
            tree.collapse(id, edge);
            prop_assert_eq!(tree.total_visible(), collapsed);
            tree.expand(id, edge);
            prop_assert_eq!(tree.total_visible(), expanded);
            prop_assert!(tree.validate().is_ok());
        }
    }

    #[test]
    fn flat_indices_agree_with_chain_order(sorts in proptest::collection::vec(any::<i64>(), 1..30)) {
        let mut tree = ReactiveTree::new();
        for (i, sort) in sorts.iter().enumerate() {
            let id = NodeId::from_raw(u64::try_from(i).unwrap() + 1);
            let key = key_for(&tree, None, *sort, id);
            tree.insert_root(id, key);
        }
        let chain: Vec<NodeId> = tree.iter_visible().collect();
        for (expected, id) in chain.iter().enumerate() {
            prop_assert_eq!(tree.index_of(*id), Some(expected));
            prop_assert_eq!(tree.node_at_index(expected), Some(*id));
        }
        // Keys ascend along the chain (unique by the id tail).
        for pair in chain.windows(2) {
            prop_assert!(tree.key(pair[0]).unwrap() < tree.key(pair[1]).unwrap());
        }
    }
}
