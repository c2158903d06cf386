use anyhow::Result;
use approx::assert_abs_diff_eq;
use looptune::backend_cpu::CpuExecutor;
use looptune::driver::{run, DriverConfig, KernelSelector, TuningSession};
use looptune::ir::{matmul, Kernel, KernelInputs, KernelModule, TransformDescriptor};
use looptune::search::{
    ActionSet, BeamConfig, BeamSearch, Cost, EvaluationFailure, Evaluator, ExecutionOracle,
    InterchangeAction, OracleConfig, SearchStrategy, TilingAction, TransformationAction,
};
use ndarray::Ix2;

fn quick_config(width: usize, depth: usize) -> DriverConfig {
    DriverConfig {
        beam: BeamConfig::new(width, depth),
        oracle: OracleConfig {
            warmup_runs: 0,
            repetitions: 1,
            ..OracleConfig::default()
        },
        ..DriverConfig::default()
    }
}

#[test]
fn tuned_matmul_matches_reference() -> Result<()> {
    let module = KernelModule::new(vec![matmul("mm", 32, 32, 32)]);
    let mut session = TuningSession::new(quick_config(2, 2))?;
    let result = session.tune(&module, &KernelSelector::Function("mm".into()))?;
    session.shutdown()?;

    assert!(result.outcome.best_cost <= result.outcome.baseline_cost);
    assert!(result.artifacts.mlir.contains("func.func @mm("));
    assert!(result
        .artifacts
        .transform_script
        .contains("transform.named_sequence @__transform_main"));
    assert_eq!(result.report.history, result.outcome.best_history);

    let inputs = KernelInputs::random(&result.root, 7);
    let tuned = CpuExecutor::new().execute(&result.artifacts.kernel, &inputs)?;
    let a = inputs.tensor(0).unwrap().clone().into_dimensionality::<Ix2>()?;
    let b = inputs.tensor(1).unwrap().clone().into_dimensionality::<Ix2>()?;
    let expected = a.dot(&b).into_dyn();
    for (lhs, rhs) in tuned.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*lhs, *rhs, epsilon = 1e-4);
    }
    Ok(())
}

#[test]
fn run_entry_point_reports_baseline() -> Result<()> {
    let root = matmul("mm", 16, 16, 16);
    let outcome = run(&root, 1, 2, 1)?;
    assert!(outcome.best_cost <= outcome.baseline_cost);
    assert_eq!(outcome.trajectory.first().map(|s| s.depth), Some(0));
    assert!(outcome.stats.levels <= 2);
    Ok(())
}

#[test]
fn failing_tile_size_never_wins_on_real_backend() -> Result<()> {
    let root = matmul("mm", 128, 128, 128);
    let actions = ActionSet::new(vec![
        TransformationAction::Tiling(TilingAction {
            sizes: vec![32, 64],
            loops: Some(vec![0]),
        }),
        TransformationAction::Interchange(InterchangeAction {
            pairs: Some(vec![(0, 1)]),
        }),
    ]);
    let oracle = ExecutionOracle::calibrate(
        CpuExecutor::new(),
        &root,
        OracleConfig {
            warmup_runs: 0,
            repetitions: 1,
            ..OracleConfig::default()
        },
    )?;
    let evaluator = |kernel: &Kernel| -> Result<Cost, EvaluationFailure> {
        if kernel.nest.loops.iter().any(|l| l.stride == 64) {
            Err(EvaluationFailure::Compilation("tile 64 unsupported".into()))
        } else {
            oracle.evaluate(kernel)
        }
    };

    let exploration = BeamSearch::new(BeamConfig::new(2, 2)).explore(root, &actions, &evaluator)?;
    for frontier in &exploration.frontiers {
        for id in frontier {
            let node = &exploration.tree[*id];
            assert!(!node.history.contains(&TransformDescriptor::Tile {
                loop_index: 0,
                size: 64,
            }));
        }
    }
    assert!(!exploration.outcome.best_history.contains(&TransformDescriptor::Tile {
        loop_index: 0,
        size: 64,
    }));
    Ok(())
}
