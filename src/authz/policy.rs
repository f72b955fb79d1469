use crate::authz::errors::AuthzError;
use crate::authz::types::*;
use kdl::KdlDocument;

/// Parse a KDL grant document into typed role and principal definitions.
pub fn parse_kdl_document(source: &str) -> Result<ParsedGrants, AuthzError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AuthzError::KdlParse(e.to_string()))?;

    let mut grants = ParsedGrants::default();

    for node in doc.nodes() {
        match node.name().value() {
            "role" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    AuthzError::InvalidGrant(
                        "role node requires a string argument (e.g. role \"cashier\")".into(),
                    )
                })?;

                let mut modules = Vec::new();
                let mut includes = Vec::new();

                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "module" => modules.push(module_grant(child, &name)?),
                            "includes" => {
                                includes = dash_list(child);
                            }
                            other => {
                                return Err(AuthzError::InvalidGrant(format!(
                                    "unexpected child `{other}` in role `{name}` (expected `module` or `includes`)"
                                )));
                            }
                        }
                    }
                }

                grants.roles.push(RoleDef {
                    name,
                    modules,
                    includes,
                });
            }
            "principal" => {
                let id = first_string_arg(node).ok_or_else(|| {
                    AuthzError::InvalidGrant(
                        "principal node requires a string argument (e.g. principal \"alice\")"
                            .into(),
                    )
                })?;

                let mut modules = Vec::new();
                let mut roles = Vec::new();

                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "module" => modules.push(module_grant(child, &id)?),
                            "roles" => {
                                roles = dash_list(child);
                            }
                            other => {
                                return Err(AuthzError::InvalidGrant(format!(
                                    "unexpected child `{other}` in principal `{id}` (expected `module` or `roles`)"
                                )));
                            }
                        }
                    }
                }

                grants.principals.push(PrincipalDef { id, roles, modules });
            }
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(grants)
}

/// `module "Sales" { - "View" - "Create" }`, owned by role or principal `owner`.
fn module_grant(node: &kdl::KdlNode, owner: &str) -> Result<ModuleGrant, AuthzError> {
    let module_slug = first_string_arg(node).ok_or_else(|| {
        AuthzError::InvalidGrant(format!(
            "module node in `{owner}` requires a module slug (e.g. module \"Sales\")"
        ))
    })?;
    validate_module_slug(&module_slug).map_err(|e| match e {
        AuthzError::InvalidArgument(msg) => {
            AuthzError::InvalidArgument(format!("{msg} (in `{owner}`)"))
        }
        other => other,
    })?;

    let actions = dash_list(node)
        .iter()
        .map(|a| a.parse::<Action>())
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ModuleGrant {
        module_slug,
        actions,
    })
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
/// Example KDL:
/// ```kdl
/// module "Sales" {
///     - "View"
///     - "Create"
/// }
/// ```
fn dash_list(node: &kdl::KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role() {
        let kdl = r#"
role "cashier" {
    module "Sales" {
        - "View"
        - "Create"
    }
    module "Dashboard" {
        - "View"
    }
}
"#;
        let grants = parse_kdl_document(kdl).unwrap();
        assert_eq!(grants.roles.len(), 1);
        let role = &grants.roles[0];
        assert_eq!(role.name, "cashier");
        assert_eq!(role.modules.len(), 2);
        assert_eq!(role.modules[0].module_slug, "Sales");
        assert_eq!(role.modules[0].actions, vec![Action::View, Action::Create]);
        assert!(role.includes.is_empty());
    }

    #[test]
    fn test_parse_role_with_includes() {
        let kdl = r#"
role "manager" {
    includes {
        - "cashier"
    }
    module "Settings" {
        - "Edit"
    }
}
"#;
        let grants = parse_kdl_document(kdl).unwrap();
        let manager = &grants.roles[0];
        assert_eq!(manager.includes, vec!["cashier"]);
        assert_eq!(manager.modules[0].actions, vec![Action::Edit]);
    }

    #[test]
    fn test_parse_principal() {
        let kdl = r#"
principal "alice" {
    roles {
        - "manager"
    }
    module "Users" {
        - "View"
        - "Delete"
    }
}
"#;
        let grants = parse_kdl_document(kdl).unwrap();
        assert_eq!(grants.principals.len(), 1);
        let alice = &grants.principals[0];
        assert_eq!(alice.id, "alice");
        assert_eq!(alice.roles, vec!["manager"]);
        assert_eq!(alice.modules[0].module_slug, "Users");
        assert_eq!(alice.modules[0].actions, vec![Action::View, Action::Delete]);
    }

    #[test]
    fn test_parse_module_without_actions() {
        let kdl = r#"
principal "bob" {
    module "Reports"
}
"#;
        let grants = parse_kdl_document(kdl).unwrap();
        assert!(grants.principals[0].modules[0].actions.is_empty());
    }

    #[test]
    fn test_parse_unknown_action() {
        let kdl = r#"
role "cashier" {
    module "Sales" {
        - "Refund"
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidArgument(_)));
    }

    #[test]
    fn test_parse_module_with_separator() {
        let kdl = r#"
principal "alice" {
    module "Sa:les" {
        - "View"
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidArgument(msg) if msg.contains("Sa:les")));
    }

    #[test]
    fn test_parse_missing_names() {
        let err = parse_kdl_document("role {\n}\n").unwrap_err();
        assert!(matches!(err, AuthzError::InvalidGrant(_)));

        let err = parse_kdl_document("principal \"carol\" {\n    module\n}\n").unwrap_err();
        assert!(matches!(err, AuthzError::InvalidGrant(_)));
    }

    #[test]
    fn test_parse_unexpected_child() {
        let kdl = r#"
principal "alice" {
    includes {
        - "manager"
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidGrant(_)));
    }

    #[test]
    fn test_unknown_top_level_ignored() {
        let kdl = r#"
resource "vm"
role "cashier"
"#;
        let grants = parse_kdl_document(kdl).unwrap();
        assert_eq!(grants.roles.len(), 1);
        assert!(grants.roles[0].modules.is_empty());
    }
}
