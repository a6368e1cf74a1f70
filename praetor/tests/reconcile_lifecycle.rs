//! End-to-end reconcile scenarios against the file-backed store.
//!
//! These tests drive the reconciler through unit exits, reports, and timer
//! firings the way a supervisor loop would, and read every result back from
//! disk.

use praetor::io::config::OrchestratorConfig;
use praetor::io::file_store::FileStore;
use praetor::io::report::Report;
use praetor::io::store::TaskStore;
use praetor::reconcile::{Reconciler, UnitExit};
use praetor::task::{BudgetSpec, Phase, RetrySpec, Task, TaskKey, Tier, TokenUsage};
use praetor::test_support::{
    ContendedStore, FixedClock, ScriptedSubstrate, at, child, task, temp_store,
};

fn key(name: &str) -> TaskKey {
    TaskKey::new("default", name)
}

fn get(store: &FileStore, name: &str) -> Task {
    store.get_task(&key(name)).expect("get task")
}

fn exit(store: &FileStore, name: &str, code: i32, output: &str) -> UnitExit {
    let unit_id = get(store, name).status.unit_id.expect("unit id");
    UnitExit {
        unit_id,
        exit_code: Some(code),
        reason: None,
        report: Report {
            output: Some(output.to_string()),
            ..Report::default()
        },
    }
}

/// Crash, back off, retry, then succeed.
///
/// Sequence:
/// 1. t=0: start attempt 1
/// 2. t=0: unit OOM-killed (137) -> Retrying, retry due at t=30
/// 3. t=30: start attempt 2
/// 4. t=40: unit exits 0 with a result block -> Completed
#[test]
fn crash_then_retry_then_complete() {
    let (_dir, store) = temp_store().expect("store");
    let substrate = ScriptedSubstrate::new();
    let clock = FixedClock::new(at(0));
    let config = OrchestratorConfig::default();
    let r = Reconciler::new(&store, &substrate, &clock, &config).expect("reconciler");

    let mut t = task("flaky");
    t.spec.retry = Some(RetrySpec {
        max_attempts: 2,
        ..RetrySpec::default()
    });
    r.admit(t).expect("admit");
    r.reconcile(&key("flaky")).expect("start");

    let mut crash = exit(&store, "flaky", 137, "");
    crash.reason = Some("OOMKilled".to_string());
    r.observe_exit(&key("flaky"), crash).expect("crash");
    assert_eq!(get(&store, "flaky").phase(), Phase::Retrying);

    clock.set(at(30));
    r.reconcile(&key("flaky")).expect("retry");
    assert_eq!(get(&store, "flaky").status.attempts, 2);

    clock.set(at(40));
    let done = exit(
        &store,
        "flaky",
        0,
        "Tokens: in=120 out=30\n[result-begin]fixed it[result-end]",
    );
    r.observe_exit(&key("flaky"), done).expect("done");

    let finished = get(&store, "flaky");
    assert_eq!(finished.phase(), Phase::Completed);
    assert_eq!(finished.status.attempts, 2);
    assert_eq!(finished.status.output.as_deref(), Some("fixed it"));
    assert_eq!(finished.status.tokens_used, Some(TokenUsage::new(120, 30)));
    assert_eq!(finished.status.history.len(), 2);
    assert_eq!(finished.status.completed_at, Some(at(40)));
    let started: Vec<String> = substrate.started().iter().map(|req| req.unit_name()).collect();
    assert_eq!(started, vec!["default-flaky-1", "default-flaky-2"]);
}

/// A parent checkpoints while its child runs and resumes once the child
/// completes.
#[test]
fn waiting_parent_resumes_when_child_completes() {
    let (_dir, store) = temp_store().expect("store");
    let substrate = ScriptedSubstrate::new();
    let clock = FixedClock::new(at(0));
    let config = OrchestratorConfig::default();
    let r = Reconciler::new(&store, &substrate, &clock, &config).expect("reconciler");

    let mut lead = task("lead");
    lead.spec.tier = Tier::Tribune;
    r.admit(lead).expect("admit lead");
    r.reconcile(&key("lead")).expect("start lead");
    r.admit(child("helper", "lead")).expect("admit helper");
    r.reconcile(&key("helper")).expect("start helper");

    let checkpoint = exit(&store, "lead", 0, r#"{"status": "waiting"}"#);
    r.observe_exit(&key("lead"), checkpoint).expect("checkpoint");
    let waiting = get(&store, "lead");
    assert_eq!(waiting.phase(), Phase::Waiting);
    assert_eq!(waiting.status.pending_children, vec!["helper".to_string()]);

    clock.set(at(20));
    r.observe_exit(&key("helper"), exit(&store, "helper", 0, "helper done"))
        .expect("helper exit");
    assert_eq!(get(&store, "helper").phase(), Phase::Completed);

    let resumed = get(&store, "lead");
    assert_eq!(resumed.phase(), Phase::Running);
    assert_eq!(resumed.status.attempts, 1);
    assert!(resumed.status.pending_children.is_empty());
    assert_eq!(resumed.status.child_tasks, vec!["helper".to_string()]);
    assert_eq!(resumed.status.last_reincarnated_at, Some(at(20)));
    assert_eq!(substrate.started().len(), 3);
}

/// One child's report drains the root's shared budget: the reporter and its
/// ancestors end BudgetExceeded and the rest of the tree is cancelled.
#[test]
fn exhausted_hierarchy_budget_stops_the_tree() {
    let (_dir, store) = temp_store().expect("store");
    let substrate = ScriptedSubstrate::new();
    let clock = FixedClock::new(at(0));
    let config = OrchestratorConfig::default();
    let r = Reconciler::new(&store, &substrate, &clock, &config).expect("reconciler");

    let mut lead = task("lead");
    lead.spec.tier = Tier::Tribune;
    lead.spec.hierarchy_budget = Some(BudgetSpec {
        max_tokens: Some(1000),
        max_cost_usd: Some("100.00".to_string()),
    });
    r.admit(lead).expect("admit lead");
    r.reconcile(&key("lead")).expect("start lead");
    r.admit(child("spender", "lead")).expect("admit spender");
    r.reconcile(&key("spender")).expect("start spender");
    r.admit(child("idle", "lead")).expect("admit idle");

    let report = Report {
        tokens: Some(TokenUsage::new(600, 400)),
        ..Report::default()
    };
    r.report(&key("spender"), report).expect("report");

    let root = get(&store, "lead");
    assert_eq!(root.phase(), Phase::BudgetExceeded);
    assert_eq!(root.status.hierarchy_tokens_used, Some(TokenUsage::new(600, 400)));
    assert_eq!(get(&store, "spender").phase(), Phase::BudgetExceeded);
    let idle = get(&store, "idle");
    assert_eq!(idle.phase(), Phase::Cancelled);
    assert!(
        idle.status
            .message
            .as_deref()
            .is_some_and(|m| m.starts_with("hierarchy budget exceeded"))
    );

    let mut terminated = substrate.terminated();
    terminated.sort();
    assert_eq!(terminated, vec!["default-lead-1", "default-spender-1"]);
}

/// A whole pass over the store starts every admitted task.
#[test]
fn reconcile_all_starts_pending_tasks() {
    let (_dir, store) = temp_store().expect("store");
    let substrate = ScriptedSubstrate::new();
    let clock = FixedClock::new(at(0));
    let config = OrchestratorConfig::default();
    let r = Reconciler::new(&store, &substrate, &clock, &config).expect("reconciler");

    r.admit(task("a")).expect("admit a");
    clock.set(at(1));
    r.admit(task("b")).expect("admit b");

    let summary = r.reconcile_all().expect("pass");
    assert_eq!(summary.reconciled, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.next_requeue_secs, Some(5));
    assert_eq!(get(&store, "a").phase(), Phase::Running);
    assert_eq!(get(&store, "b").phase(), Phase::Running);
}

/// Deleting a pending child releases its waiting parent.
#[test]
fn deleting_the_last_pending_child_resumes_the_parent() {
    let (_dir, store) = temp_store().expect("store");
    let substrate = ScriptedSubstrate::new();
    let clock = FixedClock::new(at(0));
    let config = OrchestratorConfig::default();
    let r = Reconciler::new(&store, &substrate, &clock, &config).expect("reconciler");

    let mut lead = task("lead");
    lead.spec.tier = Tier::Tribune;
    r.admit(lead).expect("admit lead");
    r.reconcile(&key("lead")).expect("start lead");
    r.admit(child("helper", "lead")).expect("admit helper");
    r.observe_exit(&key("lead"), exit(&store, "lead", 0, r#"{"status":"waiting"}"#))
        .expect("checkpoint");
    assert_eq!(get(&store, "lead").phase(), Phase::Waiting);

    r.delete(&key("helper")).expect("delete");
    assert!(store.get_task(&key("helper")).is_err());
    assert_eq!(get(&store, "lead").phase(), Phase::Running);
}

/// Both attempts of a retried child count toward the tree. The second
/// attempt's charge loses every race to the root and is caught up by the
/// next pass.
///
/// Sequence:
/// 1. t=0: lead and kid start; kid OOM-killed after reporting 100 tokens
/// 2. t=30: kid attempt 2 starts and reports 80 while the root is contended
/// 3. t=30: a full pass charges the outstanding 80
#[test]
fn tree_usage_survives_retries_and_contention() {
    let (_dir, files) = temp_store().expect("store");
    let store = ContendedStore::new(files);
    let substrate = ScriptedSubstrate::new();
    let clock = FixedClock::new(at(0));
    let config = OrchestratorConfig::default();
    let r = Reconciler::new(&store, &substrate, &clock, &config).expect("reconciler");

    let mut lead = task("lead");
    lead.spec.tier = Tier::Tribune;
    lead.spec.hierarchy_budget = Some(BudgetSpec {
        max_tokens: Some(1000),
        max_cost_usd: None,
    });
    r.admit(lead).expect("admit lead");
    r.reconcile(&key("lead")).expect("start lead");
    let mut kid = child("kid", "lead");
    kid.spec.retry = Some(RetrySpec {
        max_attempts: 1,
        ..RetrySpec::default()
    });
    r.admit(kid).expect("admit kid");
    r.reconcile(&key("kid")).expect("start kid");

    let mut crash = exit(store.inner(), "kid", 137, "Tokens: in=100 out=0");
    crash.reason = Some("OOMKilled".to_string());
    r.observe_exit(&key("kid"), crash).expect("crash");
    assert_eq!(get(store.inner(), "kid").phase(), Phase::Retrying);
    assert_eq!(
        get(store.inner(), "lead").status.hierarchy_tokens_used,
        Some(TokenUsage::new(100, 0))
    );

    clock.set(at(30));
    r.reconcile(&key("kid")).expect("retry");
    store.contend(&key("lead"), config.conflict_retry_limit);
    let report = Report {
        tokens: Some(TokenUsage::new(80, 0)),
        ..Report::default()
    };
    r.report(&key("kid"), report).expect("report");
    assert_eq!(
        get(store.inner(), "lead").status.hierarchy_tokens_used,
        Some(TokenUsage::new(100, 0))
    );

    let summary = r.reconcile_all().expect("pass");
    assert_eq!(summary.failed, 0);
    let kid = get(store.inner(), "kid");
    assert_eq!(kid.status.attempts, 2);
    assert_eq!(kid.status.tokens_used, Some(TokenUsage::new(180, 0)));
    assert_eq!(
        get(store.inner(), "lead").status.hierarchy_tokens_used,
        Some(TokenUsage::new(180, 0))
    );
}
