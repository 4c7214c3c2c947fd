// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use planq_cost::{TokenUsage, UsageCarrier};

#[test]
fn terminal_skips_running_events() {
    let run = ToolRun(vec![
        ToolEvent { state: ToolEventState::Running, summary: None, output: None, usage: None },
        ToolEvent::completed("done"),
        ToolEvent { state: ToolEventState::Running, summary: None, output: None, usage: None },
    ]);
    let terminal = run.terminal().expect("terminal event");
    assert_eq!(terminal.state, ToolEventState::Completed);
    assert_eq!(terminal.summary.as_deref(), Some("done"));
}

#[test]
fn all_running_has_no_terminal() {
    let run = ToolRun(vec![ToolEvent {
        state: ToolEventState::Running,
        summary: None,
        output: None,
        usage: None,
    }]);
    assert!(run.terminal().is_none());
}

#[test]
fn usage_comes_from_the_last_event_reporting_it() {
    let run = ToolRun(vec![
        ToolEvent::completed("first")
            .usage(TokenUsage { prompt_tokens: 1, completion_tokens: 1 }),
        ToolEvent::completed("second")
            .usage(TokenUsage { prompt_tokens: 10, completion_tokens: 20 }),
    ]);
    assert_eq!(
        run.usage(),
        Some(TokenUsage { prompt_tokens: 10, completion_tokens: 20 })
    );
}

#[tokio::test]
async fn fake_agent_plays_script_then_defaults() {
    let agent = FakeToolAgent::new();
    agent.push_failed("boom");

    let invocation = ToolInvocation {
        plan_id: "p1".into(),
        step_id: "s1".into(),
        action: "act".into(),
        tool: "tool".into(),
        input: serde_json::Value::Null,
        timeout: std::time::Duration::from_secs(5),
        subject: None,
    };

    let first = agent.execute(invocation.clone()).await.expect("scripted run");
    assert_eq!(first.terminal().map(|e| e.state), Some(ToolEventState::Failed));

    let second = agent.execute(invocation).await.expect("default run");
    assert_eq!(second.terminal().map(|e| e.state), Some(ToolEventState::Completed));
    assert_eq!(agent.invocation_count(), 2);
}
