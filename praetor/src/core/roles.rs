//! Role lookup: namespace scope shadows cluster scope.

use crate::role::Role;

/// Pick the role named `name`. A namespace role of that name hides the
/// cluster role entirely; the two are never merged.
pub fn resolve_role<'a>(
    name: &str,
    namespace_roles: &'a [Role],
    cluster_roles: &'a [Role],
) -> Option<&'a Role> {
    namespace_roles
        .iter()
        .find(|role| role.name == name)
        .or_else(|| cluster_roles.iter().find(|role| role.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::{RoleScope, RoleSpec};

    fn role(name: &str, namespace: Option<&str>, rule: &str) -> Role {
        Role {
            name: name.to_string(),
            namespace: namespace.map(ToString::to_string),
            spec: RoleSpec {
                rules: vec![rule.to_string()],
                ..RoleSpec::default()
            },
        }
    }

    #[test]
    fn namespace_role_shadows_cluster_role() {
        let local = [role("coder", Some("team"), "local rule")];
        let cluster = [role("coder", None, "cluster rule"), role("reviewer", None, "r")];
        let resolved = resolve_role("coder", &local, &cluster).expect("role");
        assert_eq!(resolved.scope(), RoleScope::Namespace);
        assert_eq!(resolved.spec.rules, vec!["local rule".to_string()]);
    }

    #[test]
    fn falls_back_to_cluster_role() {
        let cluster = [role("reviewer", None, "r")];
        let resolved = resolve_role("reviewer", &[], &cluster).expect("role");
        assert_eq!(resolved.scope(), RoleScope::Cluster);
    }

    #[test]
    fn unknown_role_resolves_to_none() {
        assert!(resolve_role("ghost", &[], &[]).is_none());
    }
}
