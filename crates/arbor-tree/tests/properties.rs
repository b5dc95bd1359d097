//! Property tests for the addressing math.
//!
//! These pin down the algebra the routing layer leans on: positions are
//! reproducible from raw integers, parent/child moves invert each other,
//! and the root's subtree tiles the whole rank space.

use proptest::prelude::*;

use arbor_tree::{Rank, Tree};

// Radix 2..=64, population 1..=500
fn tree_params() -> impl Strategy<Value = (u64, u64)> {
    (2u64..=64, 1u64..=500)
}

proptest! {
    #[test]
    fn rank_reproduces_itself((radix, n) in tree_params()) {
        let tree = Tree::new(radix, n);
        for rank in 0..n {
            let node = tree.node(rank);
            prop_assert_eq!(node.rank, rank);
            prop_assert_eq!(node.base, rank);
            prop_assert!(tree.is_consistent(&node));
        }
    }

    #[test]
    fn parent_inverts_child((radix, n) in tree_params()) {
        let tree = Tree::new(radix, n);
        for rank in 0..n {
            let node = tree.node(rank);
            for child in tree.children(&node) {
                prop_assert_eq!(tree.parent(&child).rank, node.rank);
                prop_assert_eq!(child.depth, node.depth + 1);
            }
        }
    }

    #[test]
    fn child_edges_cover_all_ranks_once((radix, n) in tree_params()) {
        // Walking child edges from the root must reach every rank exactly
        // once: ranks 1..N each appear as exactly one node's child, and
        // the root is nobody's child.
        let tree = Tree::new(radix, n);
        let mut seen = vec![0u32; n as usize];
        seen[0] += 1;
        for rank in 0..n {
            let node = tree.node(rank);
            for child in tree.children(&node) {
                prop_assert!(child.rank < n);
                seen[child.rank as usize] += 1;
            }
        }
        prop_assert!(seen.iter().all(|&c| c == 1));
    }

    #[test]
    fn traversal_visits_every_rank_once((radix, n) in tree_params()) {
        let tree = Tree::new(radix, n);
        let mut seen = vec![false; n as usize];
        let mut node = tree.node(0);
        let mut steps = 0u64;
        while node.is_valid() {
            prop_assert!(!seen[node.rank as usize], "revisited {}", node.rank);
            seen[node.rank as usize] = true;
            tree.to_next(&mut node);
            steps += 1;
            prop_assert!(steps <= n, "traversal failed to terminate");
        }
        prop_assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn subtree_stride_agrees_with_contains((radix, n) in tree_params()) {
        let tree = Tree::new(radix, n);
        for rank in 0..n {
            let node = tree.node(rank);
            let strided: Vec<Rank> = tree.subtree_ranks(&node).collect();
            for r in 0..n {
                prop_assert_eq!(
                    tree.subtree_contains(&node, r),
                    strided.contains(&r),
                    "subtree of {} vs rank {}", rank, r
                );
            }
        }
    }

    #[test]
    fn subtree_index_names_the_containing_child((radix, n) in tree_params()) {
        let tree = Tree::new(radix, n);
        for rank in 0..n {
            let node = tree.node(rank);
            let children: Vec<_> = tree.children(&node).collect();
            for r in 0..n {
                match tree.subtree_index(&node, r) {
                    Some(idx) => {
                        prop_assert!(idx < children.len());
                        prop_assert!(tree.subtree_contains(&children[idx], r));
                    }
                    None => {
                        prop_assert!(
                            r == rank || !tree.subtree_contains(&node, r)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn ancestor_chain_is_connected((radix, n) in tree_params()) {
        let tree = Tree::new(radix, n);
        for rank in 0..n {
            let node = tree.node(rank);
            let mut prev = tree.at_depth(&node, 0);
            prop_assert_eq!(prev.rank, 0);
            for d in 1..=node.depth {
                let anc = tree.at_depth(&node, d);
                prop_assert!(anc.is_valid());
                prop_assert!(tree.subtree_contains(&prev, anc.rank));
                prev = anc;
            }
            prop_assert_eq!(tree.at_depth(&node, node.depth).rank, rank);
        }
    }
}
