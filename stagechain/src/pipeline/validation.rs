//! Construction-time graph validation.

use crate::errors::CycleDetectedError;
use crate::stages::Stage;
use std::collections::HashSet;
use std::sync::Arc;

/// Identity of a stage node: the address of its shared allocation.
fn node_key(stage: &Arc<dyn Stage>) -> usize {
    Arc::as_ptr(stage).cast::<()>() as usize
}

/// Checks that no stage is reachable from itself through `children()`.
///
/// Sharing one stage between several parents (a DAG) is allowed; only a
/// stage that contains itself is rejected.
pub fn detect_cycles(root: &Arc<dyn Stage>) -> Result<(), CycleDetectedError> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    match dfs_cycle(root, &mut visited, &mut rec_stack, &mut path) {
        Some(cycle) => Err(CycleDetectedError::new(cycle)),
        None => Ok(()),
    }
}

fn dfs_cycle(
    node: &Arc<dyn Stage>,
    visited: &mut HashSet<usize>,
    rec_stack: &mut HashSet<usize>,
    path: &mut Vec<(usize, String)>,
) -> Option<Vec<String>> {
    let key = node_key(node);
    visited.insert(key);
    rec_stack.insert(key);
    path.push((key, node.id().to_string()));

    for child in node.children() {
        let child_key = node_key(&child);
        if !visited.contains(&child_key) {
            if let Some(cycle) = dfs_cycle(&child, visited, rec_stack, path) {
                return Some(cycle);
            }
        } else if rec_stack.contains(&child_key) {
            let start = path.iter().position(|(k, _)| *k == child_key).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|(_, id)| id.clone()).collect();
            cycle.push(child.id().to_string());
            return Some(cycle);
        }
    }

    path.pop();
    rec_stack.remove(&key);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationContext;
    use crate::errors::InvocationError;
    use crate::pipeline::Sequence;
    use crate::stages::passthrough;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::OnceLock;

    /// A stage whose child is bound after construction, the only way to
    /// build a self-containing graph from immutable stages.
    #[derive(Debug, Default)]
    struct LateBound {
        inner: OnceLock<Arc<dyn Stage>>,
    }

    #[async_trait]
    impl Stage for LateBound {
        fn id(&self) -> &str {
            "late"
        }

        fn children(&self) -> Vec<Arc<dyn Stage>> {
            self.inner.get().cloned().into_iter().collect()
        }

        async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
            Ok(input.clone())
        }
    }

    #[test]
    fn test_acyclic_graph_with_shared_stage() {
        let shared = passthrough("shared");
        let seq: Arc<dyn Stage> =
            Arc::new(Sequence::new(vec![shared.clone(), shared.clone(), shared]).unwrap());
        assert!(detect_cycles(&seq).is_ok());
    }

    #[test]
    fn test_self_containing_stage_is_rejected() {
        let late = Arc::new(LateBound::default());
        let seq: Arc<dyn Stage> =
            Arc::new(Sequence::new(vec![passthrough("head"), late.clone() as Arc<dyn Stage>]).unwrap());
        let _ = late.inner.set(seq.clone());

        let err = detect_cycles(&seq).unwrap_err();
        assert_eq!(err.cycle_path.first(), err.cycle_path.last());
        assert!(err.cycle_path.contains(&"late".to_string()));
    }
}
