// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn fingerprint_is_deterministic() {
    let a = Subject::builder()
        .tenant_id("acme")
        .user_id("u1")
        .scopes(["repo.write".to_string(), "ci.run".to_string()])
        .build();
    let b = Subject::builder()
        .tenant_id("acme")
        .user_id("u1")
        .scopes(["ci.run".to_string(), "repo.write".to_string()])
        .build();
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn fingerprint_distinguishes_subjects() {
    let a = Subject::builder().user_id("u1").build();
    let b = Subject::builder().user_id("u2").build();
    assert_ne!(a.fingerprint(), b.fingerprint());
}

#[test]
fn empty_fields_are_omitted_from_json() {
    let json = serde_json::to_value(Subject::default()).expect("serialize");
    assert_eq!(json, serde_json::json!({}));
}
