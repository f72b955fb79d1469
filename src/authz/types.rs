use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::authz::errors::AuthzError;

/// Prefix shared by every policy key: "Permission:{module}:{action}"
pub const POLICY_KEY_PREFIX: &str = "Permission";

/// Check that a module slug can appear inside a policy key.
///
/// Segments of a key are separated by `:` and never escaped, so a slug may
/// not contain one.
pub fn validate_module_slug(module_slug: &str) -> Result<(), AuthzError> {
    if module_slug.is_empty() {
        return Err(AuthzError::InvalidArgument(
            "module slug must not be empty".into(),
        ));
    }
    if module_slug.contains(':') {
        return Err(AuthzError::InvalidArgument(format!(
            "module slug `{module_slug}` must not contain `:`"
        )));
    }
    Ok(())
}

/// Granularity of a permission within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    View,
    Create,
    Edit,
    Delete,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::View, Action::Create, Action::Edit, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "View",
            Action::Create => "Create",
            Action::Edit => "Edit",
            Action::Delete => "Delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = AuthzError;

    /// Case-sensitive: "view" is not an action.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| {
                AuthzError::InvalidArgument(format!(
                    "unknown action `{s}` (expected one of View, Create, Edit, Delete)"
                ))
            })
    }
}

/// A (module, action) pair, the parsed form of a policy key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub module_slug: String,
    pub action: Action,
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{POLICY_KEY_PREFIX}:{}:{}", self.module_slug, self.action)
    }
}

/// Permission required by a protected operation.
///
/// Built once when the operation is registered and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionDeclaration {
    module_slug: String,
    action: Action,
    policy_key: String,
}

impl PermissionDeclaration {
    pub fn new(module_slug: impl Into<String>, action: Action) -> Result<Self, AuthzError> {
        let module_slug = module_slug.into();
        validate_module_slug(&module_slug)?;
        let policy_key = PolicyKey {
            module_slug: module_slug.clone(),
            action,
        }
        .to_string();
        Ok(Self {
            module_slug,
            action,
            policy_key,
        })
    }

    /// Build a declaration from textual inputs, e.g. values read from config.
    pub fn parse(module_slug: impl Into<String>, action: &str) -> Result<Self, AuthzError> {
        Self::new(module_slug, action.parse()?)
    }

    pub fn module_slug(&self) -> &str {
        &self.module_slug
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn policy_key(&self) -> &str {
        &self.policy_key
    }
}

/// Actions granted to a principal, keyed by module slug.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantSet {
    modules: BTreeMap<String, BTreeSet<Action>>,
}

impl GrantSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, module_slug: impl Into<String>, action: Action) {
        self.modules
            .entry(module_slug.into())
            .or_default()
            .insert(action);
    }

    /// A set holding exactly one module entry, present even when `actions` is empty.
    pub fn from_module(module_slug: &str, actions: &[Action]) -> Self {
        let mut modules = BTreeMap::new();
        modules.insert(
            module_slug.to_string(),
            actions.iter().copied().collect::<BTreeSet<_>>(),
        );
        Self { modules }
    }

    /// Builder form of [`GrantSet::grant`] for a whole action list.
    pub fn with(mut self, module_slug: &str, actions: &[Action]) -> Self {
        for action in actions {
            self.grant(module_slug, *action);
        }
        self
    }

    pub fn merge(&mut self, other: &GrantSet) {
        for (module, actions) in &other.modules {
            self.modules
                .entry(module.clone())
                .or_default()
                .extend(actions.iter().copied());
        }
    }

    /// `None` when the module has no entry at all.
    pub fn actions_for(&self, module_slug: &str) -> Option<&BTreeSet<Action>> {
        self.modules.get(module_slug)
    }
}

/// Why a policy evaluation was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    ModuleNotGranted,
    ActionNotGranted,
    MalformedKey,
    Unauthenticated,
}

impl DenyReason {
    /// Machine-readable form returned in HTTP error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::ModuleNotGranted => "module not granted",
            DenyReason::ActionNotGranted => "action not granted",
            DenyReason::MalformedKey => "malformed key",
            DenyReason::Unauthenticated => "principal not authenticated",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DenyReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyEvaluation {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
}

impl PolicyEvaluation {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

// ---------- API request/response types ----------

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    /// e.g. "alice"
    pub principal: String,
    /// e.g. "Permission:Sales:Create"
    pub policy_key: String,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl From<PolicyEvaluation> for CheckResponse {
    fn from(e: PolicyEvaluation) -> Self {
        Self {
            allowed: e.allowed,
            reason: e.reason,
        }
    }
}

// ---------- Grant file domain types ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleGrant {
    pub module_slug: String,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone)]
pub struct RoleDef {
    pub name: String,
    pub modules: Vec<ModuleGrant>,
    /// Other role names this role includes (inherits from)
    pub includes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PrincipalDef {
    pub id: String,
    pub roles: Vec<String>,
    /// Grants held directly, on top of the roles
    pub modules: Vec<ModuleGrant>,
}

/// Intermediate result from parsing a single KDL file.
#[derive(Debug, Clone, Default)]
pub struct ParsedGrants {
    pub roles: Vec<RoleDef>,
    pub principals: Vec<PrincipalDef>,
}
