// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The authenticated identity a step executes on behalf of.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity carried with every step so policy can decide per-identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub roles: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub scopes: BTreeSet<String>,
}

impl Subject {
    /// Stable fingerprint of the fields policy decisions depend on.
    ///
    /// Used as part of decision-cache keys; BTreeSet iteration order makes
    /// the fingerprint deterministic.
    pub fn fingerprint(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = &self.tenant_id {
            parts.push(format!("t:{t}"));
        }
        if let Some(u) = &self.user_id {
            parts.push(format!("u:{u}"));
        }
        for r in &self.roles {
            parts.push(format!("r:{r}"));
        }
        for s in &self.scopes {
            parts.push(format!("s:{s}"));
        }
        parts.join(",")
    }
}

crate::test_builder! {
    pub struct SubjectBuilder => Subject {
        required {
            roles: BTreeSet<String> = BTreeSet::new(),
            scopes: BTreeSet<String> = BTreeSet::new(),
        }
        optional {
            session_id: String,
            tenant_id: String,
            user_id: String,
            email: String,
            name: String,
        }
    }
}

#[cfg(test)]
#[path = "subject_tests.rs"]
mod tests;
