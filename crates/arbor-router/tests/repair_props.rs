//! Property tests for the repair protocol.
//!
//! The protocol's core promise: repair is a deterministic function of the
//! failure set, so daemons that share failure knowledge always agree on
//! the tree - and a daemon's depth never grows, no matter the order
//! deaths arrive in.

use proptest::prelude::*;

use arbor_router::{FaultScope, NextHop, Rank, Router};

// A tree shape and a failure sequence that never touches the root.
fn scenario() -> impl Strategy<Value = (u64, u64, Vec<Rank>)> {
    (2u64..=8, 2u64..=48).prop_flat_map(|(radix, n)| {
        let deaths = proptest::collection::vec(1..n, 0..6);
        (Just(radix), Just(n), deaths)
    })
}

proptest! {
    #[test]
    fn depth_only_ever_decreases((radix, n, deaths) in scenario()) {
        for rank in 0..n {
            if deaths.contains(&rank) {
                continue;
            }
            let mut router = Router::new(n, radix, rank).unwrap();
            let mut depth = router.depth();
            for &dead in &deaths {
                router.repair(&[dead], FaultScope::Local).unwrap();
                prop_assert!(router.depth() <= depth);
                depth = router.depth();
            }
        }
    }

    #[test]
    fn repair_outcome_is_order_independent((radix, n, deaths) in scenario()) {
        // Delivering the same failures one at a time, all at once, or in
        // reverse must land every surviving daemon in the same state.
        for rank in 0..n {
            if deaths.contains(&rank) {
                continue;
            }
            let mut one_at_a_time = Router::new(n, radix, rank).unwrap();
            for &dead in &deaths {
                one_at_a_time.repair(&[dead], FaultScope::Local).unwrap();
            }

            let mut all_at_once = Router::new(n, radix, rank).unwrap();
            all_at_once.repair(&deaths, FaultScope::Local).unwrap();

            let mut reversed = Router::new(n, radix, rank).unwrap();
            for &dead in deaths.iter().rev() {
                reversed.repair(&[dead], FaultScope::Local).unwrap();
            }

            prop_assert_eq!(one_at_a_time.snapshot(), all_at_once.snapshot());
            prop_assert_eq!(all_at_once.snapshot(), reversed.snapshot());
        }
    }

    #[test]
    fn repeated_notices_change_nothing((radix, n, deaths) in scenario()) {
        for rank in 0..n {
            if deaths.contains(&rank) {
                continue;
            }
            let mut router = Router::new(n, radix, rank).unwrap();
            router.repair(&deaths, FaultScope::Local).unwrap();
            let settled = router.snapshot();

            let reports = router.repair(&deaths, FaultScope::Local).unwrap();
            prop_assert!(reports.is_empty());
            prop_assert_eq!(router.snapshot(), settled);
        }
    }

    #[test]
    fn converged_daemons_route_every_live_pair((radix, n, deaths) in scenario()) {
        let mut routers = Vec::with_capacity(n as usize);
        for rank in 0..n {
            let mut router = Router::new(n, radix, rank).unwrap();
            router.repair(&deaths, FaultScope::Local).unwrap();
            routers.push(router);
        }

        let live: Vec<Rank> = (0..n).filter(|r| !deaths.contains(r)).collect();
        let bound = 2 * n; // generous; real paths are O(depth)
        for &src in &live {
            for &dst in &live {
                let mut at = src;
                let mut hops = 0u64;
                while at != dst {
                    match routers[at as usize].next_hop(dst) {
                        NextHop::Forward(next) => {
                            prop_assert!(
                                !deaths.contains(&next),
                                "{src}->{dst} routed through dead {next}"
                            );
                            at = next;
                        }
                        other => {
                            prop_assert!(false, "route {src}->{dst} stalled at {at}: {other:?}");
                            unreachable!();
                        }
                    }
                    hops += 1;
                    prop_assert!(hops <= bound, "route {src}->{dst} did not terminate");
                }
            }
        }
    }

    #[test]
    fn adoption_from_the_new_parent_reconciles((radix, n, deaths) in scenario()) {
        // After convergence, every parent's announced chain must reconcile
        // cleanly at each of its children with nothing left to infer.
        let mut routers = Vec::with_capacity(n as usize);
        for rank in 0..n {
            let mut router = Router::new(n, radix, rank).unwrap();
            router.repair(&deaths, FaultScope::Local).unwrap();
            routers.push(router);
        }

        for rank in 0..n {
            if deaths.contains(&rank) {
                continue;
            }
            let children: Vec<Rank> = routers[rank as usize].children().collect();
            let mut chain = routers[rank as usize].ancestors().to_vec();
            chain.push(rank);
            for child in children {
                if deaths.contains(&child) {
                    continue;
                }
                let inferred = routers[child as usize]
                    .reconcile_adoption(&chain)
                    .unwrap();
                prop_assert!(
                    inferred.is_empty(),
                    "child {child} of {rank} still inferred {inferred:?}"
                );
            }
        }
    }
}
