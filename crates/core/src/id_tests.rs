// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn generated_ids_carry_prefix() {
    let id = TraceId::new();
    assert!(id.as_str().starts_with("trc-"));
    assert_eq!(id.as_str().len(), "trc-".len() + 19);
}

#[test]
fn generated_ids_are_unique() {
    let a = RequestId::new();
    let b = RequestId::new();
    assert_ne!(a, b);
}

#[test]
fn from_string_round_trips() {
    let id = TraceId::from_string("trc-fixed");
    assert_eq!(id, "trc-fixed");
    assert_eq!(id.to_string(), "trc-fixed");
}

#[test]
fn serde_is_transparent() {
    let id = RequestId::from_string("req-abc");
    let json = serde_json::to_string(&id).expect("serialize");
    assert_eq!(json, "\"req-abc\"");
    let back: RequestId = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, id);
}
