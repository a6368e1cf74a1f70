//! Execution request builder.
//!
//! Renders the system prompt from the resolved role, the task's flavor and
//! exit criteria, and the tier's runtime rules, then packages it with the
//! model, capabilities, and input files the substrate needs.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::policy_validator::effective_capabilities;
use crate::core::selector::effective_timeout;
use crate::io::substrate::ExecRequest;
use crate::policy::{EgressRule, Policy};
use crate::role::Role;
use crate::task::Task;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

#[derive(Debug, Clone, Serialize)]
struct RoleContext<'a> {
    name: &'a str,
    description: &'a str,
}

/// Inputs for one execution request.
pub struct RequestInputs<'a> {
    pub task: &'a Task,
    pub role: Option<&'a Role>,
    pub policies: &'a [Policy],
    /// Attempt number the unit will serve.
    pub attempt: u32,
    pub default_image: &'a str,
    pub default_timeout_secs: i64,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system prompt template")?;
        Ok(Self { env })
    }

    pub fn render_system(&self, task: &Task, role: Option<&Role>) -> Result<String> {
        let spec = &task.spec;
        let capabilities = effective_capabilities(spec.tier, &spec.capabilities);
        let (rules, anti_patterns, tools) = match role {
            Some(role) => (
                role.spec.rules.as_slice(),
                role.spec.anti_patterns.as_slice(),
                role.spec.tools.as_slice(),
            ),
            None => (&[][..], &[][..], &[][..]),
        };
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            task_name => task.name(),
            tier => spec.tier.as_str(),
            role => role.map(|role| RoleContext {
                name: &role.name,
                description: role.spec.description.trim(),
            }),
            parent => spec.parent(),
            rules => rules,
            anti_patterns => anti_patterns,
            tools => tools,
            flavor => spec.flavor.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            capabilities => capabilities,
            agentic => spec.tier.is_agentic(),
            max_iterations => max_iterations(task),
            exit_criteria => spec.exit_criteria.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// Build the full request for starting `inputs.task`.
    pub fn build_request(&self, inputs: &RequestInputs<'_>) -> Result<ExecRequest> {
        let task = inputs.task;
        let spec = &task.spec;
        let system_prompt = self
            .render_system(task, inputs.role)
            .with_context(|| format!("render system prompt for {}", task.key()))?;
        let capabilities = effective_capabilities(spec.tier, &spec.capabilities);
        let model = spec.model.clone().unwrap_or_default();
        let image = spec
            .image
            .clone()
            .filter(|image| !image.is_empty())
            .unwrap_or_else(|| inputs.default_image.to_string());

        let mut env = BTreeMap::new();
        env.insert("PRAETOR_PROMPT".to_string(), spec.prompt.clone());
        env.insert("PRAETOR_TASK_NAME".to_string(), task.name().to_string());
        env.insert(
            "PRAETOR_TASK_NAMESPACE".to_string(),
            task.metadata.namespace.clone(),
        );
        env.insert("PRAETOR_TIER".to_string(), spec.tier.as_str().to_string());
        if let Some(role) = &spec.role {
            env.insert("PRAETOR_ROLE".to_string(), role.clone());
        }
        if !capabilities.is_empty() {
            env.insert("PRAETOR_CAPABILITIES".to_string(), capabilities.join(","));
        }
        if !model.name.is_empty() {
            env.insert("PRAETOR_MODEL".to_string(), model.name.clone());
        }

        debug!(
            task = %task.key(),
            attempt = inputs.attempt,
            prompt_bytes = system_prompt.len(),
            "built execution request"
        );
        Ok(ExecRequest {
            task: task.key(),
            attempt: inputs.attempt,
            tier: spec.tier,
            image,
            model,
            system_prompt,
            prompt: spec.prompt.clone(),
            capabilities,
            tools: inputs
                .role
                .map(|role| role.spec.tools.clone())
                .unwrap_or_default(),
            input_files: spec.input_files.clone(),
            timeout_secs: effective_timeout(task, inputs.default_timeout_secs),
            max_iterations: max_iterations(task),
            egress: egress_allowlist(inputs.policies),
            env,
        })
    }
}

fn max_iterations(task: &Task) -> u32 {
    task.spec
        .max_iterations
        .filter(|n| *n > 0)
        .unwrap_or_else(|| task.spec.tier.default_max_iterations())
}

/// Union of every policy's egress rules, deduplicated by host and ports.
fn egress_allowlist(policies: &[Policy]) -> Vec<EgressRule> {
    let mut rules: Vec<EgressRule> = Vec::new();
    for rule in policies.iter().flat_map(|p| &p.spec.egress_allowlist) {
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicySpec;
    use crate::role::RoleSpec;
    use crate::task::Tier;
    use crate::test_support::{child, task};

    fn role() -> Role {
        Role {
            name: "coder".to_string(),
            namespace: Some("default".to_string()),
            spec: RoleSpec {
                description: "Writes Rust.".to_string(),
                tools: vec!["cargo".to_string()],
                rules: vec!["Run the tests before finishing".to_string()],
                anti_patterns: vec!["Editing generated files".to_string()],
                ..RoleSpec::default()
            },
        }
    }

    fn inputs<'a>(task: &'a Task, role: Option<&'a Role>, policies: &'a [Policy]) -> RequestInputs<'a> {
        RequestInputs {
            task,
            role,
            policies,
            attempt: 1,
            default_image: "agent:default",
            default_timeout_secs: 600,
        }
    }

    #[test]
    fn system_prompt_carries_role_rules_and_flavor() {
        let mut t = task("fix-bug");
        t.spec.flavor = Some("Prefer small diffs.".to_string());
        t.spec.exit_criteria = Some("all tests pass".to_string());
        let role = role();
        let rendered = PromptEngine::new()
            .expect("engine")
            .render_system(&t, Some(&role))
            .expect("render");
        assert!(rendered.contains("acting as coder"));
        assert!(rendered.contains("- Run the tests before finishing"));
        assert!(rendered.contains("- Editing generated files"));
        assert!(rendered.contains("Prefer small diffs."));
        assert!(rendered.contains("Stop when: all tests pass"));
        assert!(rendered.contains("single pass"));
    }

    /// Agentic tiers get the planning budget and the implicit spawn grant.
    #[test]
    fn tribune_request_uses_tier_defaults() {
        let mut t = child("planner", "root");
        t.spec.tier = Tier::Tribune;
        t.spec.capabilities = vec!["shell".to_string()];
        let engine = PromptEngine::new().expect("engine");
        let request = engine.build_request(&inputs(&t, None, &[])).expect("request");
        assert_eq!(request.max_iterations, 5);
        assert_eq!(request.capabilities, vec!["shell".to_string(), "spawn".to_string()]);
        assert_eq!(request.image, "agent:default");
        assert_eq!(request.timeout_secs, 600);
        assert_eq!(request.env.get("PRAETOR_TIER").map(String::as_str), Some("tribune"));
        assert!(request.system_prompt.contains("at most 5 iteration(s)"));
        assert!(request.system_prompt.contains("spawned by task root"));
    }

    #[test]
    fn request_merges_policy_egress() {
        let t = task("fetch");
        let rule = EgressRule {
            host: "api.github.com".to_string(),
            ports: vec![443],
        };
        let policy = |name: &str| Policy {
            name: name.to_string(),
            namespace: "default".to_string(),
            spec: PolicySpec {
                egress_allowlist: vec![rule.clone()],
                ..PolicySpec::default()
            },
        };
        let policies = [policy("a"), policy("b")];
        let role = role();
        let request = PromptEngine::new()
            .expect("engine")
            .build_request(&inputs(&t, Some(&role), &policies))
            .expect("request");
        assert_eq!(request.egress, vec![rule]);
        assert_eq!(request.tools, vec!["cargo".to_string()]);
    }
}
