//! Admission-time validation: field checks, parent cascade, namespace policy.
//!
//! Every check runs; a single call reports every violation. Inputs are never
//! mutated and nothing here touches storage (the caller fetches the parent
//! and the namespace policies first).

use std::collections::BTreeSet;

use wildmatch::WildMatch;

use crate::core::budget::parse_cost;
use crate::core::types::Violation;
use crate::policy::Policy;
use crate::task::{Task, TaskSpec, Tier};

/// Capability implicitly held by every tribune and centurion.
pub const SPAWN_CAPABILITY: &str = "spawn";

/// Validate `task` on its own and, when `parent` is given, against its parent.
pub fn validate_task(task: &Task, parent: Option<&Task>) -> Vec<Violation> {
    let mut violations = Vec::new();
    validate_fields(&task.spec, &mut violations);
    if let Some(parent) = parent {
        validate_against_parent(&task.spec, &parent.spec, &mut violations);
    }
    violations
}

fn validate_fields(spec: &TaskSpec, out: &mut Vec<Violation>) {
    match &spec.model {
        None => out.push(Violation::required("spec.model", "model is required")),
        Some(model) => {
            if model.name.trim().is_empty() {
                out.push(Violation::required(
                    "spec.model.name",
                    "model name is required",
                ));
            }
            if model.endpoint.trim().is_empty() {
                out.push(Violation::required(
                    "spec.model.endpoint",
                    "model endpoint is required",
                ));
            }
        }
    }

    if let Some(timeout) = spec.timeout
        && timeout <= 0
    {
        out.push(Violation::invalid(
            "spec.timeout",
            format!("{timeout}: timeout must be > 0"),
        ));
    }

    if let Some(budget) = &spec.budget {
        if let Some(max_tokens) = budget.max_tokens
            && max_tokens <= 0
        {
            out.push(Violation::invalid(
                "spec.budget.maxTokens",
                format!("{max_tokens}: maxTokens must be > 0"),
            ));
        }
        if let Some(raw) = budget.cost() {
            match parse_cost(raw) {
                Err(_) => out.push(Violation::invalid(
                    "spec.budget.maxCostUsd",
                    format!("{raw:?}: must be a valid number"),
                )),
                Ok(cost) if cost <= 0.0 => out.push(Violation::invalid(
                    "spec.budget.maxCostUsd",
                    format!("{raw:?}: maxCostUsd must be > 0"),
                )),
                Ok(_) => {}
            }
        }
    }

    if let Some(hierarchy) = &spec.hierarchy_budget {
        if let Some(max_tokens) = hierarchy.max_tokens
            && max_tokens <= 0
        {
            out.push(Violation::invalid(
                "spec.hierarchyBudget.maxTokens",
                format!("{max_tokens}: maxTokens must be > 0"),
            ));
        }
        if let Some(raw) = hierarchy.cost()
            && !matches!(parse_cost(raw), Ok(cost) if cost > 0.0)
        {
            out.push(Violation::invalid(
                "spec.hierarchyBudget.maxCostUsd",
                format!("{raw:?}: must be a positive number"),
            ));
        }
    }
}

fn validate_against_parent(child: &TaskSpec, parent: &TaskSpec, out: &mut Vec<Violation>) {
    if child.tier.rank() > parent.tier.rank() {
        out.push(Violation::forbidden(
            "spec.tier",
            format!(
                "child tier {:?} exceeds parent tier {:?}",
                child.tier.as_str(),
                parent.tier.as_str()
            ),
        ));
    }

    if let (Some(child_budget), Some(parent_budget)) = (&child.budget, &parent.budget) {
        if let (Some(child_tokens), Some(parent_tokens)) =
            (child_budget.max_tokens, parent_budget.max_tokens)
            && child_tokens > parent_tokens
        {
            out.push(Violation::forbidden(
                "spec.budget.maxTokens",
                "child maxTokens exceeds parent maxTokens",
            ));
        }
        // An unparsable side is reported by its own field check, not here.
        if let (Some(child_raw), Some(parent_raw)) = (child_budget.cost(), parent_budget.cost())
            && let (Ok(child_cost), Ok(parent_cost)) = (parse_cost(child_raw), parse_cost(parent_raw))
            && child_cost > parent_cost
        {
            out.push(Violation::forbidden(
                "spec.budget.maxCostUsd",
                "child maxCostUsd exceeds parent maxCostUsd",
            ));
        }
    }

    let granted: BTreeSet<String> = effective_capabilities(parent.tier, &parent.capabilities)
        .into_iter()
        .collect();
    for capability in &child.capabilities {
        if !granted.contains(capability) {
            out.push(Violation::forbidden(
                "spec.capabilities",
                format!(
                    "child capability {capability:?} not in parent capabilities {:?}",
                    granted.iter().collect::<Vec<_>>()
                ),
            ));
        }
    }
}

/// Declared capabilities plus `spawn` for agentic tiers, deduplicated, in
/// declaration order.
pub fn effective_capabilities(tier: Tier, declared: &[String]) -> Vec<String> {
    let mut caps: Vec<String> = Vec::with_capacity(declared.len() + 1);
    for capability in declared {
        if !caps.contains(capability) {
            caps.push(capability.clone());
        }
    }
    if tier.is_agentic() && !caps.iter().any(|c| c == SPAWN_CAPABILITY) {
        caps.push(SPAWN_CAPABILITY.to_string());
    }
    caps
}

/// Check `task` against every namespace policy.
///
/// `default_image` is substituted when the task names no image. The
/// concurrency cap is not checked here; see [`concurrency_limit_reached`].
pub fn check_policies(task: &Task, policies: &[Policy], default_image: &str) -> Vec<Violation> {
    let spec = &task.spec;
    let mut out = Vec::new();

    for policy in policies {
        let name = &policy.name;
        let rules = &policy.spec;

        let mut denied_hit = BTreeSet::new();
        for capability in &spec.capabilities {
            if rules.denied_capabilities.contains(capability) {
                denied_hit.insert(capability.as_str());
                out.push(Violation::forbidden(
                    "spec.capabilities",
                    format!("capability {capability:?} is denied by policy {name}"),
                ));
            }
        }
        if !rules.allowed_capabilities.is_empty() {
            for capability in &spec.capabilities {
                if !denied_hit.contains(capability.as_str())
                    && !rules.allowed_capabilities.contains(capability)
                {
                    out.push(Violation::forbidden(
                        "spec.capabilities",
                        format!("capability {capability:?} is not allowed by policy {name}"),
                    ));
                }
            }
        }

        if !rules.allowed_images.is_empty() {
            let image = spec
                .image
                .as_deref()
                .filter(|image| !image.is_empty())
                .unwrap_or(default_image);
            let matched = rules
                .allowed_images
                .iter()
                .any(|pattern| WildMatch::new(pattern).matches(image));
            if !matched {
                out.push(Violation::forbidden(
                    "spec.image",
                    format!("image {image:?} is not allowed by policy {name}"),
                ));
            }
        }

        if let (Some(limit), Some(budget)) = (&rules.max_budget, &spec.budget) {
            if let (Some(max), Some(tokens)) = (limit.max_tokens, budget.max_tokens)
                && tokens > max
            {
                out.push(Violation::forbidden(
                    "spec.budget.maxTokens",
                    format!("token budget {tokens} exceeds policy {name} limit of {max}"),
                ));
            }
            if let (Some(max_raw), Some(raw)) = (limit.cost(), budget.cost())
                && let (Ok(max), Ok(cost)) = (parse_cost(max_raw), parse_cost(raw))
                && cost > max
            {
                out.push(Violation::forbidden(
                    "spec.budget.maxCostUsd",
                    format!("cost budget {raw} exceeds policy {name} limit of {max_raw}"),
                ));
            }
        }

        if let (Some(max), Some(timeout)) = (rules.max_timeout, spec.timeout)
            && timeout > max
        {
            out.push(Violation::forbidden(
                "spec.timeout",
                format!("timeout {timeout} exceeds policy {name} limit of {max}"),
            ));
        }

        if let Some(max_tier) = rules.max_tier
            && spec.tier.rank() > max_tier.rank()
        {
            out.push(Violation::forbidden(
                "spec.tier",
                format!(
                    "tier {:?} exceeds policy {name} max tier {:?}",
                    spec.tier.as_str(),
                    max_tier.as_str()
                ),
            ));
        }
    }

    out
}

/// First policy whose concurrency cap is met by `running` tasks, as a message.
pub fn concurrency_limit_reached(policies: &[Policy], running: usize) -> Option<String> {
    policies.iter().find_map(|policy| {
        let cap = policy.spec.max_concurrent_tasks.filter(|cap| *cap > 0)?;
        (running >= cap as usize).then(|| {
            format!(
                "namespace has {running} running tasks, policy {} limits to {cap}",
                policy.name
            )
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ViolationKind;
    use crate::policy::PolicySpec;
    use crate::task::{BudgetSpec, ModelSpec};

    fn model() -> Option<ModelSpec> {
        Some(ModelSpec {
            name: "claude-sonnet".to_string(),
            endpoint: "http://llm.local".to_string(),
        })
    }

    fn task(name: &str, tier: Tier) -> Task {
        Task::new(
            "default",
            name,
            TaskSpec {
                prompt: "do the thing".to_string(),
                tier,
                model: model(),
                ..TaskSpec::default()
            },
        )
    }

    fn budget(tokens: i64, cost: &str) -> Option<BudgetSpec> {
        Some(BudgetSpec {
            max_tokens: Some(tokens),
            max_cost_usd: Some(cost.to_string()),
        })
    }

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn fields(violations: &[Violation]) -> Vec<&str> {
        violations.iter().map(|v| v.field.as_str()).collect()
    }

    #[test]
    fn valid_root_has_no_violations() {
        assert!(validate_task(&task("root", Tier::Tribune), None).is_empty());
    }

    /// A centurion under a legionary parent.
    #[test]
    fn child_tier_above_parent_yields_one_tier_violation() {
        let parent = task("parent", Tier::Legionary);
        let child = task("child", Tier::Centurion);
        let violations = validate_task(&child, Some(&parent));
        assert_eq!(fields(&violations), vec!["spec.tier"]);
        assert_eq!(violations[0].kind, ViolationKind::Forbidden);
    }

    /// The model is mandatory.
    #[test]
    fn missing_model_is_required() {
        let mut child = task("child", Tier::Legionary);
        child.spec.model = None;
        let violations = validate_task(&child, None);
        assert!(
            violations
                .iter()
                .any(|v| v.field == "spec.model" && v.kind == ViolationKind::Required)
        );
    }

    #[test]
    fn blank_model_name_and_endpoint_are_both_reported() {
        let mut child = task("child", Tier::Legionary);
        child.spec.model = Some(ModelSpec::default());
        let violations = validate_task(&child, None);
        assert_eq!(
            fields(&violations),
            vec!["spec.model.name", "spec.model.endpoint"]
        );
    }

    /// Both budget components over the parent ceiling.
    #[test]
    fn child_budget_over_parent_yields_two_violations() {
        let mut parent = task("parent", Tier::Tribune);
        parent.spec.budget = budget(1000, "1.00");
        let mut child = task("child", Tier::Legionary);
        child.spec.budget = budget(2000, "2.00");
        let violations = validate_task(&child, Some(&parent));
        assert_eq!(
            fields(&violations),
            vec!["spec.budget.maxTokens", "spec.budget.maxCostUsd"]
        );
    }

    #[test]
    fn budget_ceiling_skipped_when_parent_side_unset() {
        let mut parent = task("parent", Tier::Tribune);
        parent.spec.budget = Some(BudgetSpec {
            max_tokens: None,
            max_cost_usd: Some("1.00".to_string()),
        });
        let mut child = task("child", Tier::Legionary);
        child.spec.budget = budget(5000, "0.50");
        assert!(validate_task(&child, Some(&parent)).is_empty());
    }

    /// `spawn` is implicitly granted by a tribune parent.
    #[test]
    fn spawn_is_implicitly_granted_by_tribune() {
        let mut parent = task("parent", Tier::Tribune);
        parent.spec.capabilities = caps(&["shell"]);
        let mut child = task("child", Tier::Legionary);
        child.spec.capabilities = caps(&["spawn"]);
        assert!(validate_task(&child, Some(&parent)).is_empty());
    }

    #[test]
    fn spawn_is_not_granted_by_legionary() {
        let mut parent = task("parent", Tier::Legionary);
        parent.spec.capabilities = caps(&["shell"]);
        let mut child = task("child", Tier::Legionary);
        child.spec.capabilities = caps(&["spawn"]);
        let violations = validate_task(&child, Some(&parent));
        assert_eq!(fields(&violations), vec!["spec.capabilities"]);
        assert!(violations[0].message.contains("\"spawn\""));
    }

    #[test]
    fn each_escalated_capability_is_its_own_violation() {
        let mut parent = task("parent", Tier::Centurion);
        parent.spec.capabilities = caps(&["shell"]);
        let mut child = task("child", Tier::Legionary);
        child.spec.capabilities = caps(&["shell", "web-fetch", "exec"]);
        let violations = validate_task(&child, Some(&parent));
        assert_eq!(violations.len(), 2);
        assert!(
            violations[0]
                .message
                .ends_with("not in parent capabilities [\"shell\", \"spawn\"]")
        );
    }

    #[test]
    fn non_numeric_cost_is_distinct_from_non_positive() {
        let mut bad = task("bad", Tier::Legionary);
        bad.spec.budget = budget(10, "abc");
        let mut zero = task("zero", Tier::Legionary);
        zero.spec.budget = budget(10, "0");

        let bad_violations = validate_task(&bad, None);
        let zero_violations = validate_task(&zero, None);
        assert!(bad_violations[0].message.contains("must be a valid number"));
        assert!(zero_violations[0].message.contains("maxCostUsd must be > 0"));
    }

    #[test]
    fn non_positive_timeout_and_tokens_are_invalid() {
        let mut child = task("child", Tier::Legionary);
        child.spec.timeout = Some(0);
        child.spec.budget = Some(BudgetSpec {
            max_tokens: Some(-1),
            max_cost_usd: None,
        });
        let violations = validate_task(&child, None);
        assert_eq!(
            fields(&violations),
            vec!["spec.timeout", "spec.budget.maxTokens"]
        );
        assert!(violations.iter().all(|v| v.kind == ViolationKind::Invalid));
    }

    /// Checks are not short-circuited.
    #[test]
    fn every_violation_is_reported_in_one_call() {
        let mut parent = task("parent", Tier::Legionary);
        parent.spec.budget = budget(100, "0.10");
        let mut child = task("child", Tier::Tribune);
        child.spec.model = None;
        child.spec.timeout = Some(-5);
        child.spec.budget = budget(200, "0.20");
        child.spec.capabilities = caps(&["shell"]);
        let violations = validate_task(&child, Some(&parent));
        assert_eq!(
            fields(&violations),
            vec![
                "spec.model",
                "spec.timeout",
                "spec.tier",
                "spec.budget.maxTokens",
                "spec.budget.maxCostUsd",
                "spec.capabilities",
            ]
        );
    }

    #[test]
    fn validation_is_pure_and_idempotent() {
        let mut parent = task("parent", Tier::Legionary);
        parent.spec.budget = budget(100, "0.10");
        let mut child = task("child", Tier::Tribune);
        child.spec.budget = budget(200, "x");
        let (child_before, parent_before) = (child.clone(), parent.clone());

        let first = validate_task(&child, Some(&parent));
        let second = validate_task(&child, Some(&parent));
        assert_eq!(first, second);
        assert_eq!(child, child_before);
        assert_eq!(parent, parent_before);
    }

    #[test]
    fn violation_display_is_field_qualified() {
        let violation = Violation::forbidden("spec.tier", "nope");
        assert_eq!(violation.to_string(), "spec.tier: Forbidden: nope");
    }

    #[test]
    fn effective_capabilities_dedupes_and_injects_spawn() {
        assert_eq!(
            effective_capabilities(Tier::Centurion, &caps(&["shell", "shell"])),
            caps(&["shell", "spawn"])
        );
        assert_eq!(
            effective_capabilities(Tier::Tribune, &caps(&["spawn", "shell"])),
            caps(&["spawn", "shell"])
        );
        assert_eq!(
            effective_capabilities(Tier::Legionary, &caps(&["shell"])),
            caps(&["shell"])
        );
    }

    fn policy(spec: PolicySpec) -> Policy {
        Policy {
            name: "guard".to_string(),
            namespace: "default".to_string(),
            spec,
        }
    }

    #[test]
    fn denied_capability_overrides_allowed() {
        let mut child = task("child", Tier::Legionary);
        child.spec.capabilities = caps(&["shell"]);
        let policies = [policy(PolicySpec {
            allowed_capabilities: caps(&["shell"]),
            denied_capabilities: caps(&["shell"]),
            ..PolicySpec::default()
        })];
        let violations = check_policies(&child, &policies, "agent:latest");
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("is denied by policy guard"));
    }

    #[test]
    fn capability_outside_whitelist_is_rejected() {
        let mut child = task("child", Tier::Legionary);
        child.spec.capabilities = caps(&["shell", "web-fetch"]);
        let policies = [policy(PolicySpec {
            allowed_capabilities: caps(&["shell"]),
            ..PolicySpec::default()
        })];
        let violations = check_policies(&child, &policies, "agent:latest");
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("\"web-fetch\" is not allowed"));
    }

    #[test]
    fn default_image_is_matched_when_task_has_none() {
        let child = task("child", Tier::Legionary);
        let policies = [policy(PolicySpec {
            allowed_images: vec!["ghcr.io/praetor/*".to_string()],
            ..PolicySpec::default()
        })];
        assert!(check_policies(&child, &policies, "ghcr.io/praetor/agent:1").is_empty());
        let violations = check_policies(&child, &policies, "docker.io/evil:1");
        assert_eq!(fields(&violations), vec!["spec.image"]);
    }

    #[test]
    fn policy_ceilings_cover_budget_timeout_and_tier() {
        let mut child = task("child", Tier::Tribune);
        child.spec.budget = budget(5000, "5.00");
        child.spec.timeout = Some(7200);
        let policies = [policy(PolicySpec {
            max_budget: budget(1000, "1.00"),
            max_timeout: Some(3600),
            max_tier: Some(Tier::Centurion),
            ..PolicySpec::default()
        })];
        let violations = check_policies(&child, &policies, "agent:latest");
        assert_eq!(
            fields(&violations),
            vec![
                "spec.budget.maxTokens",
                "spec.budget.maxCostUsd",
                "spec.timeout",
                "spec.tier"
            ]
        );
    }

    #[test]
    fn concurrency_cap_counts_running_tasks() {
        let policies = [policy(PolicySpec {
            max_concurrent_tasks: Some(2),
            ..PolicySpec::default()
        })];
        assert!(concurrency_limit_reached(&policies, 1).is_none());
        let message = concurrency_limit_reached(&policies, 2).expect("cap reached");
        assert_eq!(
            message,
            "namespace has 2 running tasks, policy guard limits to 2"
        );
    }
}
