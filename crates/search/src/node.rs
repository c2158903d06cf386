//! Search tree arena.
//!
//! Nodes live in one `Vec` and refer to each other by [`NodeId`]. Parent links
//! are provenance only; the arena owns every node.

use crate::oracle::{Cost, EvaluationFailure};
use looptune_ir::{Kernel, LoopNest, TransformDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Index;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Measured(Cost),
    Failed(EvaluationFailure),
}

#[derive(Debug, Clone)]
pub struct SearchNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub history: Vec<TransformDescriptor>,
    pub state: Kernel,
    outcome: Option<Outcome>,
}

impl SearchNode {
    pub fn depth(&self) -> usize {
        self.history.len()
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Measured cost; `None` when unevaluated or failed.
    pub fn cost(&self) -> Option<Cost> {
        match self.outcome {
            Some(Outcome::Measured(cost)) => Some(cost),
            _ => None,
        }
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, Some(Outcome::Failed(_)))
    }

    pub fn last_edit(&self) -> Option<&TransformDescriptor> {
        self.history.last()
    }
}

#[derive(Debug, Clone)]
pub struct SearchTree {
    nodes: Vec<SearchNode>,
    seen: HashSet<LoopNest>,
}

impl SearchTree {
    pub fn new(root: Kernel) -> Self {
        let mut seen = HashSet::new();
        seen.insert(root.nest.clone());
        Self {
            nodes: vec![SearchNode {
                id: NodeId(0),
                parent: None,
                children: Vec::new(),
                history: Vec::new(),
                state: root,
                outcome: None,
            }],
            seen,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&SearchNode> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SearchNode> {
        self.nodes.iter()
    }

    /// Whether an identical loop nest is already somewhere in the tree.
    pub fn contains_state(&self, state: &Kernel) -> bool {
        self.seen.contains(&state.nest)
    }

    /// Attach `state`, produced from `parent` by `edit`, as a new child.
    pub fn add_child(&mut self, parent: NodeId, edit: TransformDescriptor, state: Kernel) -> NodeId {
        let id = NodeId(self.nodes.len());
        let mut history = self.nodes[parent.0].history.clone();
        history.push(edit);
        self.seen.insert(state.nest.clone());
        self.nodes.push(SearchNode {
            id,
            parent: Some(parent),
            children: Vec::new(),
            history,
            state,
            outcome: None,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Record an evaluation outcome. Outcomes are write-once; returns `false`
    /// when the node already had one.
    pub fn record(&mut self, id: NodeId, outcome: Outcome) -> bool {
        let node = &mut self.nodes[id.0];
        if node.outcome.is_some() {
            return false;
        }
        node.outcome = Some(outcome);
        true
    }

    /// Node ids from the root down to `id`.
    pub fn path(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.nodes[current.0].parent {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }
}

impl Index<NodeId> for SearchTree {
    type Output = SearchNode;

    fn index(&self, id: NodeId) -> &Self::Output {
        &self.nodes[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use looptune_ir::{apply_edit, matmul};

    #[test]
    fn children_extend_parent_history_by_one() {
        let root = matmul("mm", 16, 16, 16);
        let mut tree = SearchTree::new(root.clone());

        let edit = TransformDescriptor::Tile { loop_index: 0, size: 4 };
        let state = apply_edit(&root, &edit).unwrap();
        let child = tree.add_child(tree.root(), edit.clone(), state.clone());

        let swap = TransformDescriptor::swap(4, 0, 1);
        let grand_state = apply_edit(&state, &swap).unwrap();
        let grandchild = tree.add_child(child, swap.clone(), grand_state);

        assert_eq!(tree[child].depth(), 1);
        assert_eq!(tree[grandchild].history, vec![edit, swap]);
        assert_eq!(tree[grandchild].parent, Some(child));
        assert_eq!(tree[tree.root()].children, vec![child]);
        assert_eq!(tree.path(grandchild), vec![tree.root(), child, grandchild]);
        assert!(tree.contains_state(&state));
    }

    #[test]
    fn outcome_is_write_once() {
        let mut tree = SearchTree::new(matmul("mm", 8, 8, 8));
        let root = tree.root();
        assert!(tree.record(root, Outcome::Measured(Cost::from_millis(2.0))));
        assert!(!tree.record(root, Outcome::Measured(Cost::from_millis(1.0))));
        assert_eq!(tree[root].cost(), Some(Cost::from_millis(2.0)));
    }
}
