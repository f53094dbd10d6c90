//! Test assertions for invocation errors and results.

use crate::errors::InvocationError;
use crate::pipeline::InvocationResult;

/// Asserts that an error's path equals `expected`.
pub fn assert_failed_at(err: &InvocationError, expected: &[&str]) {
    let actual: Vec<&str> = err.path().iter().map(String::as_str).collect();
    assert_eq!(
        actual, expected,
        "Expected failure at {expected:?}, got {actual:?} ({err})"
    );
}

/// Asserts that a collect-all branch named `branch` failed during the run.
pub fn assert_branch_failed(result: &InvocationResult, branch: &str) {
    assert!(
        result.branch_failures.iter().any(|f| f.branch == branch),
        "Expected branch '{branch}' to have failed; failures: {:?}",
        result
            .branch_failures
            .iter()
            .map(|f| f.branch.as_str())
            .collect::<Vec<_>>()
    );
}

/// Asserts that no branch failed during the run.
pub fn assert_not_partial(result: &InvocationResult) {
    assert!(
        !result.is_partial(),
        "Expected a complete result, but {} branch(es) failed",
        result.branch_failures.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageExecutionError;

    #[test]
    fn test_assert_failed_at() {
        let err: InvocationError = StageExecutionError::function("leaf", "boom").into();
        assert_failed_at(&err.within("branch:a"), &["branch:a", "leaf"]);
    }

    #[test]
    #[should_panic(expected = "Expected failure at")]
    fn test_assert_failed_at_mismatch() {
        let err: InvocationError = StageExecutionError::function("leaf", "boom").into();
        assert_failed_at(&err, &["other"]);
    }
}
