use looptune_ir::{matmul, matvec, Kernel};
use looptune_search::{
    ActionSet, BeamConfig, BeamSearch, Cost, EvaluationFailure, SearchStrategy,
};
use proptest::prelude::*;

fn salted_cost(salt: u64) -> impl Fn(&Kernel) -> Result<Cost, EvaluationFailure> + Send + Sync {
    move |kernel: &Kernel| {
        let mixed = kernel.fingerprint() ^ salt;
        let value = mixed.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 40;
        Ok(Cost::from_millis(1.0 + value as f64))
    }
}

fn kernel_for(choice: u8) -> Kernel {
    match choice % 3 {
        0 => matmul("mm", 16, 32, 16),
        1 => matvec("mv", 64, 32),
        _ => matmul("mm", 32, 16, 8),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn frontier_never_exceeds_width(
        width in 1usize..4,
        depth in 0usize..4,
        salt in any::<u64>(),
        choice in any::<u8>(),
    ) {
        let evaluator = salted_cost(salt);
        let exploration = BeamSearch::new(BeamConfig::new(width, depth))
            .explore(kernel_for(choice), &ActionSet::default(), &evaluator)
            .unwrap();

        for frontier in &exploration.frontiers {
            prop_assert!(frontier.len() <= width);
        }
        prop_assert!(exploration.outcome.levels.len() <= depth);
    }

    #[test]
    fn nodes_extend_parent_history(
        width in 1usize..4,
        salt in any::<u64>(),
        choice in any::<u8>(),
    ) {
        let evaluator = salted_cost(salt);
        let exploration = BeamSearch::new(BeamConfig::new(width, 3))
            .explore(kernel_for(choice), &ActionSet::default(), &evaluator)
            .unwrap();

        let tree = &exploration.tree;
        for node in tree.nodes() {
            prop_assert_eq!(node.depth(), node.history.len());
            if let Some(parent) = node.parent {
                let parent = &tree[parent];
                prop_assert_eq!(node.depth(), parent.depth() + 1);
                prop_assert_eq!(&node.history[..parent.history.len()], &parent.history[..]);
                prop_assert!(parent.children.contains(&node.id));
            } else {
                prop_assert!(node.history.is_empty());
            }
        }
    }

    #[test]
    fn best_so_far_is_monotone_and_bounded_by_baseline(
        width in 1usize..4,
        depth in 1usize..4,
        salt in any::<u64>(),
        choice in any::<u8>(),
    ) {
        let evaluator = salted_cost(salt);
        let root = kernel_for(choice);
        let outcome = BeamSearch::new(BeamConfig::new(width, depth))
            .search(root.clone(), &ActionSet::default(), &evaluator)
            .unwrap();

        prop_assert_eq!(Ok(outcome.baseline_cost), evaluator(&root));
        prop_assert!(outcome.best_cost <= outcome.baseline_cost);
        let mut previous = outcome.baseline_cost.millis();
        for level in &outcome.levels {
            prop_assert!(level.best_cost_ms <= previous);
            previous = level.best_cost_ms;
        }
        prop_assert_eq!(previous, outcome.best_cost.millis());
    }

    #[test]
    fn repeated_runs_agree(
        width in 1usize..4,
        depth in 0usize..4,
        salt in any::<u64>(),
    ) {
        let evaluator = salted_cost(salt);
        let search = BeamSearch::new(BeamConfig::new(width, depth));
        let first = search.search(matmul("mm", 32, 32, 32), &ActionSet::default(), &evaluator).unwrap();
        let second = search.search(matmul("mm", 32, 32, 32), &ActionSet::default(), &evaluator).unwrap();
        prop_assert_eq!(first.best_history, second.best_history);
        prop_assert_eq!(first.best_cost, second.best_cost);
    }
}
