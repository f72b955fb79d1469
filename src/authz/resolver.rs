use crate::authz::errors::AuthzError;
use crate::authz::types::{
    Action, DenyReason, GrantSet, PolicyEvaluation, PolicyKey, POLICY_KEY_PREFIX,
};

/// Parse "Permission:{module}:{action}" back into its (module, action) pair.
///
/// Module slugs are not escaped, so any extra `:` makes the key malformed.
pub fn parse_policy_key(key: &str) -> Result<PolicyKey, AuthzError> {
    let malformed = || AuthzError::MalformedPolicyKey(key.to_string());

    let mut parts = key.split(':');
    let (Some(prefix), Some(module), Some(action), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };

    if prefix != POLICY_KEY_PREFIX || module.is_empty() {
        return Err(malformed());
    }
    let action: Action = action.parse().map_err(|_| malformed())?;

    Ok(PolicyKey {
        module_slug: module.to_string(),
        action,
    })
}

/// Same decision as [`evaluate`], but a malformed key comes back as the error.
pub fn try_evaluate(key: &str, grants: &GrantSet) -> Result<PolicyEvaluation, AuthzError> {
    let parsed = parse_policy_key(key)?;

    let Some(actions) = grants.actions_for(&parsed.module_slug) else {
        return Ok(PolicyEvaluation::deny(DenyReason::ModuleNotGranted));
    };
    if !actions.contains(&parsed.action) {
        return Ok(PolicyEvaluation::deny(DenyReason::ActionNotGranted));
    }
    Ok(PolicyEvaluation::allow())
}

/// Evaluate `key` against a principal's grants. Never fails open: a key that
/// does not parse is a configuration error and is denied.
pub fn evaluate(key: &str, grants: &GrantSet) -> PolicyEvaluation {
    match try_evaluate(key, grants) {
        Ok(evaluation) => evaluation,
        Err(e) => {
            tracing::error!(policy_key = key, error = %e, "policy key could not be resolved");
            PolicyEvaluation::deny(DenyReason::MalformedKey)
        }
    }
}
