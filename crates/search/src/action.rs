//! Transformation actions: enumerable parameter spaces over the four rewrite
//! families.
//!
//! Each action proposes descriptors suited to the current nest and asks the IR
//! layer whether they apply. Rejected proposals are returned alongside the
//! accepted ones so callers can count them; they are never errors.

use looptune_ir::{apply_edit, Kernel, Rejected, TransformDescriptor, TransformKind};
use serde::{Deserialize, Serialize};

/// A proposed edit plus the IR layer's verdict on it.
#[derive(Debug, Clone)]
pub struct CandidateEdit {
    pub descriptor: TransformDescriptor,
    pub verdict: Result<Kernel, Rejected>,
}

impl CandidateEdit {
    pub fn is_accepted(&self) -> bool {
        self.verdict.is_ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TilingAction {
    pub sizes: Vec<usize>,
    /// Loop positions to tile; every loop when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loops: Option<Vec<usize>>,
}

impl Default for TilingAction {
    fn default() -> Self {
        Self {
            sizes: vec![8, 16, 32, 64],
            loops: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterchangeAction {
    /// Loop position pairs to swap; every pair when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairs: Option<Vec<(usize, usize)>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorizationAction {
    pub widths: Vec<usize>,
}

impl Default for VectorizationAction {
    fn default() -> Self {
        Self {
            widths: vec![4, 8, 16],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransformationAction {
    Tiling(TilingAction),
    Interchange(InterchangeAction),
    Parallelization,
    Vectorization(VectorizationAction),
}

impl TransformationAction {
    pub fn kind(&self) -> TransformKind {
        match self {
            TransformationAction::Tiling(_) => TransformKind::Tiling,
            TransformationAction::Interchange(_) => TransformKind::Interchange,
            TransformationAction::Parallelization => TransformKind::Parallelization,
            TransformationAction::Vectorization(_) => TransformKind::Vectorization,
        }
    }

    /// Descriptors worth proposing for `kernel`, in a fixed order.
    pub fn enumerate(&self, kernel: &Kernel) -> Vec<TransformDescriptor> {
        let depth = kernel.nest.len();
        match self {
            TransformationAction::Tiling(tiling) => {
                let loops: Vec<usize> = match &tiling.loops {
                    Some(loops) => loops.clone(),
                    None => (0..depth).collect(),
                };
                loops
                    .into_iter()
                    .flat_map(|loop_index| {
                        tiling
                            .sizes
                            .iter()
                            .map(move |&size| TransformDescriptor::Tile { loop_index, size })
                    })
                    .collect()
            }
            TransformationAction::Interchange(interchange) => {
                let pairs: Vec<(usize, usize)> = match &interchange.pairs {
                    Some(pairs) => pairs.clone(),
                    None => (0..depth)
                        .flat_map(|a| ((a + 1)..depth).map(move |b| (a, b)))
                        .collect(),
                };
                pairs
                    .into_iter()
                    .map(|(a, b)| TransformDescriptor::swap(depth, a, b))
                    .collect()
            }
            TransformationAction::Parallelization => {
                vec![TransformDescriptor::Parallelize { loop_index: 0 }]
            }
            TransformationAction::Vectorization(vectorization) => vectorization
                .widths
                .iter()
                .map(|&width| TransformDescriptor::Vectorize { width })
                .collect(),
        }
    }

    /// Enumerate and try every descriptor against `kernel`.
    pub fn expand(&self, kernel: &Kernel) -> Vec<CandidateEdit> {
        self.enumerate(kernel)
            .into_iter()
            .map(|descriptor| {
                let verdict = apply_edit(kernel, &descriptor);
                CandidateEdit {
                    descriptor,
                    verdict,
                }
            })
            .collect()
    }
}

/// The actions a strategy iterates over, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionSet {
    pub actions: Vec<TransformationAction>,
}

impl Default for ActionSet {
    fn default() -> Self {
        Self {
            actions: vec![
                TransformationAction::Tiling(TilingAction::default()),
                TransformationAction::Interchange(InterchangeAction::default()),
                TransformationAction::Parallelization,
                TransformationAction::Vectorization(VectorizationAction::default()),
            ],
        }
    }
}

impl ActionSet {
    pub fn new(actions: Vec<TransformationAction>) -> Self {
        Self { actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn expand(&self, kernel: &Kernel) -> Vec<CandidateEdit> {
        self.actions
            .iter()
            .flat_map(|action| action.expand(kernel))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use looptune_ir::matmul;

    #[test]
    fn tiling_enumerates_loops_times_sizes() {
        let kernel = matmul("mm", 64, 64, 16);
        let action = TransformationAction::Tiling(TilingAction {
            sizes: vec![8, 32],
            loops: None,
        });
        let candidates = action.expand(&kernel);
        assert_eq!(candidates.len(), 6);

        // k has extent 16, so a 32 tile cannot apply
        let accepted: Vec<_> = candidates
            .iter()
            .filter(|c| c.is_accepted())
            .map(|c| c.descriptor.clone())
            .collect();
        assert_eq!(accepted.len(), 5);
        assert!(!accepted.contains(&TransformDescriptor::Tile { loop_index: 2, size: 32 }));
    }

    #[test]
    fn interchange_defaults_to_all_pairs() {
        let kernel = matmul("mm", 8, 8, 8);
        let action = TransformationAction::Interchange(InterchangeAction::default());
        let descriptors = action.enumerate(&kernel);
        assert_eq!(
            descriptors,
            vec![
                TransformDescriptor::Interchange { permutation: vec![1, 0, 2] },
                TransformDescriptor::Interchange { permutation: vec![2, 1, 0] },
                TransformDescriptor::Interchange { permutation: vec![0, 2, 1] },
            ]
        );
        assert!(action.expand(&kernel).iter().all(CandidateEdit::is_accepted));
    }

    #[test]
    fn vectorization_waits_for_tiling() {
        let kernel = matmul("mm", 32, 32, 32);
        let action = TransformationAction::Vectorization(VectorizationAction::default());
        assert!(action.expand(&kernel).iter().all(|c| !c.is_accepted()));

        let tiled = apply_edit(&kernel, &TransformDescriptor::Tile { loop_index: 2, size: 8 })
            .expect("tile");
        let accepted: Vec<_> = action
            .expand(&tiled)
            .into_iter()
            .filter(|c| c.is_accepted())
            .map(|c| c.descriptor)
            .collect();
        assert_eq!(
            accepted,
            vec![
                TransformDescriptor::Vectorize { width: 4 },
                TransformDescriptor::Vectorize { width: 8 },
            ]
        );
    }

    #[test]
    fn default_action_set_covers_every_kind() {
        let set = ActionSet::default();
        let kinds: Vec<_> = set.actions.iter().map(|a| a.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                TransformKind::Tiling,
                TransformKind::Interchange,
                TransformKind::Parallelization,
                TransformKind::Vectorization,
            ]
        );
        let json = serde_json::to_string(&set).unwrap();
        let back: ActionSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
