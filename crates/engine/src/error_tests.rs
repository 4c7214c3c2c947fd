// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn policy_violation_lists_reasons() {
    let err = EngineError::PolicyViolation(vec![
        DenyReason::with_capability("missing_capability", "repo.write"),
        DenyReason::new("tenant_suspended"),
    ]);
    let rendered = err.to_string();
    assert!(rendered.contains("missing_capability (repo.write)"));
    assert!(rendered.contains("tenant_suspended"));
}

#[test]
fn unknown_step_names_the_pair() {
    let err = EngineError::UnknownStep { plan_id: "p1".into(), step_id: "s2".into() };
    assert_eq!(err.to_string(), "no step 's2' pending for plan 'p1'");
}
