use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::authz::errors::AuthzError;
use crate::authz::policy::parse_kdl_document;
use crate::authz::types::*;
use crate::authz::GrantDirectory;

/// Load all `.kdl` grant files from the given directory and compile them
/// into a single immutable `GrantDirectory`.
pub fn load_grants(dir: &Path) -> Result<GrantDirectory, AuthzError> {
    if !dir.is_dir() {
        return Err(AuthzError::InvalidGrant(format!(
            "grants directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut all_parsed = Vec::new();

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    for entry in &entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AuthzError::GrantLoadError {
                path: path.display().to_string(),
                source,
            })?;
        all_parsed.push(parse_kdl_document(&contents)?);
    }

    let directory = compile_grants(all_parsed)?;

    tracing::info!(
        files = entries.len(),
        roles = directory.role_count,
        principals = directory.principals.len(),
        "Loaded grant files"
    );

    Ok(directory)
}

/// Merge parsed grant files and flatten roles into per-principal grant sets.
///
/// Later definitions of the same role or principal replace earlier ones.
pub fn compile_grants(parsed: Vec<ParsedGrants>) -> Result<GrantDirectory, AuthzError> {
    let mut roles: HashMap<String, RoleDef> = HashMap::new();
    let mut principals: HashMap<String, PrincipalDef> = HashMap::new();

    for p in parsed {
        for role in p.roles {
            roles.insert(role.name.clone(), role);
        }
        for principal in p.principals {
            principals.insert(principal.id.clone(), principal);
        }
    }

    for role in roles.values() {
        for included in &role.includes {
            if !roles.contains_key(included) {
                return Err(AuthzError::UndefinedRole(included.clone()));
            }
        }
    }
    check_role_cycles(&roles)?;

    let role_grants: HashMap<&str, GrantSet> = roles
        .keys()
        .map(|name| (name.as_str(), collect_role_grants(name, &roles, &mut HashSet::new())))
        .collect();

    let mut compiled = HashMap::with_capacity(principals.len());
    for (id, def) in principals {
        let mut grants = GrantSet::new();
        for role in &def.roles {
            let role_set = role_grants
                .get(role.as_str())
                .ok_or_else(|| AuthzError::UndefinedRole(role.clone()))?;
            grants.merge(role_set);
        }
        grants.merge(&module_grants(&def.modules));
        compiled.insert(id, Arc::new(grants));
    }

    Ok(GrantDirectory {
        principals: compiled,
        role_count: roles.len(),
    })
}

fn module_grants(modules: &[ModuleGrant]) -> GrantSet {
    let mut set = GrantSet::new();
    for m in modules {
        // an empty action list still creates the module entry
        set.merge(&GrantSet::from_module(&m.module_slug, &m.actions));
    }
    set
}

/// Check for cycles in role inheritance using DFS.
fn check_role_cycles(roles: &HashMap<String, RoleDef>) -> Result<(), AuthzError> {
    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();

    for name in roles.keys() {
        if !visited.contains(name) {
            dfs_cycle_check(name, roles, &mut visited, &mut in_stack)?;
        }
    }
    Ok(())
}

fn dfs_cycle_check(
    name: &str,
    roles: &HashMap<String, RoleDef>,
    visited: &mut HashSet<String>,
    in_stack: &mut HashSet<String>,
) -> Result<(), AuthzError> {
    visited.insert(name.to_string());
    in_stack.insert(name.to_string());

    if let Some(role) = roles.get(name) {
        for included in &role.includes {
            if in_stack.contains(included.as_str()) {
                return Err(AuthzError::CyclicRoleInheritance(format!(
                    "{name} -> {included}"
                )));
            }
            if !visited.contains(included.as_str()) {
                dfs_cycle_check(included, roles, visited, in_stack)?;
            }
        }
    }

    in_stack.remove(name);
    Ok(())
}

/// Recursively collect a role's grants, following includes.
fn collect_role_grants(
    role_name: &str,
    roles: &HashMap<String, RoleDef>,
    visited: &mut HashSet<String>,
) -> GrantSet {
    if !visited.insert(role_name.to_string()) {
        return GrantSet::new();
    }
    let Some(role) = roles.get(role_name) else {
        return GrantSet::new();
    };

    let mut grants = module_grants(&role.modules);
    for included in &role.includes {
        grants.merge(&collect_role_grants(included, roles, visited));
    }
    grants
}
