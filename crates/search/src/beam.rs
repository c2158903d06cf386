//! Beam search over transformation sequences.
//!
//! # Algorithm
//!
//! 1. Evaluate the root kernel; it is the baseline and the first best-so-far.
//! 2. Expand every frontier node through every action (in parallel).
//! 3. Drop rejected edits, legality defects and, optionally, duplicate states.
//! 4. Evaluate the new children, serially or on the pool.
//! 5. Keep the `beam_width` cheapest successful children as the next frontier.
//! 6. Stop at `max_depth`, on an empty frontier, or when the time budget runs
//!    out. The best node of the whole run is returned.

use crate::action::ActionSet;
use crate::config::{BeamConfig, EvaluationMode};
use crate::error::SearchError;
use crate::node::{NodeId, Outcome, SearchTree};
use crate::oracle::{Cost, EvaluationFailure, Evaluator};
use crate::strategy::{
    LevelSummary, SearchOutcome, SearchStats, SearchStrategy, Termination, TrajectoryStep,
};
use looptune_ir::{check_legality, Kernel};
use rayon::prelude::*;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Everything a search produced, including the full tree.
pub struct Exploration {
    pub outcome: SearchOutcome,
    pub tree: SearchTree,
    /// Surviving node ids after each level.
    pub frontiers: Vec<Vec<NodeId>>,
}

#[derive(Debug, Clone, Default)]
pub struct BeamSearch {
    config: BeamConfig,
}

impl BeamSearch {
    pub fn new(config: BeamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BeamConfig {
        &self.config
    }

    /// Run the search and keep the tree for inspection.
    pub fn explore(
        &self,
        root: Kernel,
        actions: &ActionSet,
        evaluator: &dyn Evaluator,
    ) -> Result<Exploration, SearchError> {
        self.config.validate().map_err(SearchError::InvalidConfig)?;
        check_legality(&root).map_err(SearchError::IllegalRoot)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_threads.unwrap_or(0))
            .build()
            .map_err(|err| SearchError::WorkerPool(err.to_string()))?;
        let parallel_eval =
            self.config.evaluation == EvaluationMode::Parallel && evaluator.reentrant();
        if self.config.evaluation == EvaluationMode::Parallel && !parallel_eval {
            info!(
                scope = %evaluator.scope(),
                "parallel evaluation requested but the evaluator is not reentrant; evaluating serially"
            );
        }

        let start = Instant::now();
        let budget = self.config.time_budget_ms.map(Duration::from_millis);

        let mut tree = SearchTree::new(root);
        let root_id = tree.root();
        let baseline = match evaluator.evaluate(&tree[root_id].state) {
            Ok(cost) => cost,
            Err(failure) => {
                error!(kernel = %tree[root_id].state.name, %failure, "baseline evaluation failed");
                return Err(SearchError::BaselineFailed(failure));
            }
        };
        tree.record(root_id, Outcome::Measured(baseline));
        info!(
            kernel = %tree[root_id].state.name,
            schedule = %tree[root_id].state.schedule_summary(),
            baseline_ms = baseline.millis(),
            beam_width = self.config.beam_width,
            max_depth = self.config.max_depth,
            "starting beam search"
        );

        let mut stats = SearchStats {
            evaluated: 1,
            ..SearchStats::default()
        };
        let mut best = (root_id, baseline);
        let mut frontier = vec![root_id];
        let mut frontiers = Vec::new();
        let mut levels = Vec::new();
        let mut termination = Termination::MaxDepth;

        for depth in 1..=self.config.max_depth {
            if budget.is_some_and(|limit| start.elapsed() >= limit) {
                info!(depth, "time budget exhausted");
                termination = Termination::BudgetExhausted;
                break;
            }

            let mut level = LevelSummary {
                depth,
                ..LevelSummary::default()
            };

            // 1. materialize (frontier node x action) pairs
            let work: Vec<(NodeId, usize)> = frontier
                .iter()
                .flat_map(|&id| (0..actions.actions.len()).map(move |a| (id, a)))
                .collect();
            let expansions: Vec<_> = pool.install(|| {
                work.par_iter()
                    .map(|&(id, a)| (id, actions.actions[a].expand(&tree[id].state)))
                    .collect()
            });

            let mut created = Vec::new();
            for (parent, candidates) in expansions {
                for candidate in candidates {
                    level.candidates += 1;
                    let state = match candidate.verdict {
                        Ok(state) => state,
                        Err(reason) => {
                            trace!(edit = %candidate.descriptor, %reason, "edit not applicable");
                            level.rejected += 1;
                            continue;
                        }
                    };
                    if let Err(violation) = check_legality(&state) {
                        error!(
                            edit = %candidate.descriptor,
                            schedule = %state.schedule_summary(),
                            %violation,
                            "accepted edit produced an illegal nest"
                        );
                        level.legality_defects += 1;
                        continue;
                    }
                    if self.config.deduplicate && tree.contains_state(&state) {
                        level.duplicates += 1;
                        continue;
                    }
                    created.push(tree.add_child(parent, candidate.descriptor, state));
                }
            }

            // 2. evaluate
            let outcomes: Vec<Result<Cost, EvaluationFailure>> = if parallel_eval {
                pool.install(|| {
                    created
                        .par_iter()
                        .map(|&id| evaluator.evaluate(&tree[id].state))
                        .collect()
                })
            } else {
                created
                    .iter()
                    .map(|&id| evaluator.evaluate(&tree[id].state))
                    .collect()
            };

            for (&id, outcome) in created.iter().zip(outcomes) {
                match outcome {
                    Ok(cost) => {
                        level.evaluated += 1;
                        tree.record(id, Outcome::Measured(cost));
                        if cost < best.1 {
                            best = (id, cost);
                        }
                    }
                    Err(failure) => {
                        debug!(
                            schedule = %tree[id].state.schedule_summary(),
                            %failure,
                            "candidate evaluation failed"
                        );
                        level.failed += 1;
                        tree.record(id, Outcome::Failed(failure));
                    }
                }
            }

            // 3. select
            let mut ranked: Vec<(Cost, usize, NodeId)> = created
                .iter()
                .filter_map(|&id| tree[id].cost().map(|cost| (cost, tree[id].depth(), id)))
                .collect();
            ranked.sort();
            frontier = ranked
                .into_iter()
                .take(self.config.beam_width)
                .map(|(_, _, id)| id)
                .collect();

            level.frontier = frontier.len();
            level.best_cost_ms = best.1.millis();
            level.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            info!(
                depth,
                candidates = level.candidates,
                rejected = level.rejected,
                duplicates = level.duplicates,
                evaluated = level.evaluated,
                failed = level.failed,
                frontier = level.frontier,
                best_ms = level.best_cost_ms,
                "search level complete"
            );
            stats.absorb(&level);
            levels.push(level);
            frontiers.push(frontier.clone());

            if frontier.is_empty() {
                termination = Termination::EmptyFrontier;
                break;
            }
        }

        stats.nodes = tree.len();
        stats.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let (best_id, best_cost) = best;
        let trajectory = tree
            .path(best_id)
            .into_iter()
            .map(|id| {
                let node = &tree[id];
                TrajectoryStep {
                    depth: node.depth(),
                    edit: node.last_edit().cloned(),
                    cost: node.cost(),
                    schedule: node.state.schedule_summary(),
                }
            })
            .collect();

        let outcome = SearchOutcome {
            best_history: tree[best_id].history.clone(),
            best_cost,
            baseline_cost: baseline,
            best_state: tree[best_id].state.clone(),
            trajectory,
            levels,
            stats,
            termination,
        };
        info!(
            best_ms = best_cost.millis(),
            baseline_ms = baseline.millis(),
            speedup = outcome.speedup(),
            depth = outcome.best_history.len(),
            termination = ?termination,
            "beam search finished"
        );

        Ok(Exploration {
            outcome,
            tree,
            frontiers,
        })
    }
}

impl SearchStrategy for BeamSearch {
    fn name(&self) -> &'static str {
        "beam"
    }

    fn search(
        &self,
        root: Kernel,
        actions: &ActionSet,
        evaluator: &dyn Evaluator,
    ) -> Result<SearchOutcome, SearchError> {
        self.explore(root, actions, evaluator)
            .map(|exploration| exploration.outcome)
    }
}
