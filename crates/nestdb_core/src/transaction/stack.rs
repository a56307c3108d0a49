//! The chain of open transaction nodes.

use super::node::{Leases, NodeKind, TransactionNode, TransactionState};
use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;

/// Open transaction nodes from the root (index 0) to the current node.
///
/// Each node names its parent by ID; the parent of the node at index `i`
/// is always the node at `i - 1`. Popped nodes are closed for good.
#[derive(Debug)]
pub(crate) struct TransactionStack {
    nodes: Vec<TransactionNode>,
    next_id: u64,
}

impl Default for TransactionStack {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            next_id: 1,
        }
    }
}

impl TransactionStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pushes a node of `kind` on top of the current node.
    pub(crate) fn push(&mut self, kind: NodeKind) -> TransactionId {
        let id = TransactionId(self.next_id);
        self.next_id += 1;
        let parent = self.current().map(|n| n.id);
        self.nodes.push(TransactionNode::new(id, parent, kind));
        id
    }

    /// Pops the current node and marks it closed.
    pub(crate) fn pop(&mut self) -> Option<TransactionNode> {
        let mut node = self.nodes.pop()?;
        node.state = TransactionState::Closed;
        Some(node)
    }

    /// Pops the current node and folds its bookkeeping into the new current node.
    pub(crate) fn pop_into_parent(&mut self) -> Option<TransactionNode> {
        let mut node = self.pop()?;
        if let Some(parent) = self.nodes.last_mut() {
            parent.absorb(&mut node);
        }
        Some(node)
    }

    pub(crate) fn clear(&mut self) -> Vec<TransactionNode> {
        let mut nodes = std::mem::take(&mut self.nodes);
        for node in &mut nodes {
            node.state = TransactionState::Closed;
        }
        nodes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn current(&self) -> Option<&TransactionNode> {
        self.nodes.last()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut TransactionNode> {
        self.nodes.last_mut()
    }

    pub(crate) fn root(&self) -> Option<&TransactionNode> {
        self.nodes.first()
    }

    pub(crate) fn at(&self, pos: usize) -> Option<&TransactionNode> {
        self.nodes.get(pos)
    }

    pub(crate) fn at_mut(&mut self, pos: usize) -> Option<&mut TransactionNode> {
        self.nodes.get_mut(pos)
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = &TransactionNode> {
        self.nodes.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut TransactionNode> {
        self.nodes.iter_mut()
    }

    /// Stack position of a live node.
    pub(crate) fn position(&self, id: TransactionId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Stack position of a live node, or the error for a retired or unknown ID.
    pub(crate) fn locate(&self, id: TransactionId) -> CoreResult<usize> {
        match self.position(id) {
            Some(pos) => Ok(pos),
            None if self.is_retired(id) => Err(CoreError::ClosedTransaction { txn: id }),
            None => Err(CoreError::invalid_request(format!("unknown transaction {id}"))),
        }
    }

    /// True for IDs handed out by this stack that are no longer live.
    pub(crate) fn is_retired(&self, id: TransactionId) -> bool {
        id.0 < self.next_id && self.position(id).is_none()
    }

    /// State of `id`, with retired IDs reported as closed.
    pub(crate) fn state_of(&self, id: TransactionId) -> Option<TransactionState> {
        match self.position(id) {
            Some(pos) => Some(self.nodes[pos].state),
            None if self.is_retired(id) => Some(TransactionState::Closed),
            None => None,
        }
    }

    /// Nearest node at or below `pos` that is a savepoint or the root.
    pub(crate) fn boundary_at_or_below(&self, pos: usize) -> usize {
        (0..=pos.min(self.nodes.len().saturating_sub(1)))
            .rev()
            .find(|&i| self.nodes[i].is_boundary())
            .unwrap_or(0)
    }

    pub(crate) fn has_savepoint(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Savepoint { .. }))
    }

    /// Innermost savepoint node.
    pub(crate) fn innermost_savepoint(&self) -> Option<&TransactionNode> {
        self.nodes
            .iter()
            .rev()
            .find(|n| matches!(n.kind, NodeKind::Savepoint { .. }))
    }

    /// The root's connection leases.
    pub(crate) fn leases(&self) -> Option<&Leases> {
        match &self.nodes.first()?.kind {
            NodeKind::Root { leases } => Some(leases),
            _ => None,
        }
    }

    pub(crate) fn leases_mut(&mut self) -> Option<&mut Leases> {
        match &mut self.nodes.first_mut()?.kind {
            NodeKind::Root { leases } => Some(leases),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BindId;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn root() -> NodeKind {
        NodeKind::Root {
            leases: BTreeMap::new(),
        }
    }

    fn savepoint(name: &str) -> NodeKind {
        NodeKind::Savepoint {
            name: name.into(),
            handles: BTreeMap::new(),
        }
    }

    #[test]
    fn push_links_parents() {
        let mut stack = TransactionStack::new();
        let a = stack.push(root());
        let b = stack.push(NodeKind::Subtransaction);
        assert_eq!(stack.current().unwrap().parent, Some(a));
        assert_eq!(stack.current().unwrap().id, b);
        assert_eq!(stack.root().unwrap().id, a);
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut stack = TransactionStack::new();
        let a = stack.push(root());
        stack.pop();
        let b = stack.push(root());
        assert!(b > a);
        assert_eq!(stack.state_of(a), Some(TransactionState::Closed));
        assert!(matches!(stack.locate(a), Err(CoreError::ClosedTransaction { .. })));
        assert!(matches!(
            stack.locate(TransactionId(99)),
            Err(CoreError::InvalidRequest { .. })
        ));
        assert_eq!(stack.state_of(TransactionId(99)), None);
    }

    #[test]
    fn pop_into_parent_merges_sets() {
        let mut stack = TransactionStack::new();
        stack.push(root());
        stack.push(savepoint("sp_1"));
        stack
            .current_mut()
            .unwrap()
            .dirty
            .insert(crate::types::InstanceId(7));
        let popped = stack.pop_into_parent().unwrap();
        assert_eq!(popped.state, TransactionState::Closed);
        assert!(stack.current().unwrap().dirty.contains(&crate::types::InstanceId(7)));
    }

    #[test]
    fn boundary_skips_subtransactions() {
        let mut stack = TransactionStack::new();
        stack.push(root());
        stack.push(savepoint("sp_1"));
        stack.push(NodeKind::Subtransaction);
        stack.push(NodeKind::Subtransaction);
        assert_eq!(stack.boundary_at_or_below(3), 1);
        assert_eq!(stack.boundary_at_or_below(0), 0);
        assert!(stack.has_savepoint());
        assert_eq!(stack.innermost_savepoint().unwrap().id, TransactionId(2));
    }

    #[test]
    fn leases_live_on_the_root() {
        let mut stack = TransactionStack::new();
        assert!(stack.leases().is_none());
        stack.push(root());
        assert!(stack.leases_mut().unwrap().get(&BindId::DEFAULT).is_none());
    }

    proptest! {
        #[test]
        fn popped_ids_stay_closed(pushes in 1usize..8, pops in 0usize..8) {
            let mut stack = TransactionStack::new();
            let mut ids = vec![stack.push(root())];
            for _ in 1..pushes {
                ids.push(stack.push(NodeKind::Subtransaction));
            }
            for _ in 0..pops.min(pushes) {
                stack.pop();
            }
            for (pos, id) in ids.iter().enumerate() {
                let live = pos < stack.len();
                prop_assert_eq!(stack.position(*id).is_some(), live);
                prop_assert_eq!(stack.is_retired(*id), !live);
            }
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
