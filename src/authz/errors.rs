use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Invalid argument: {0}")]
    #[diagnostic(
        code(pos_authz::authz::invalid_argument),
        help("Permission declarations need a non-empty module slug without `:` and one of View, Create, Edit, Delete")
    )]
    InvalidArgument(String),

    #[error("Malformed policy key `{0}`")]
    #[diagnostic(
        code(pos_authz::authz::malformed_policy_key),
        help("Policy keys have the shape Permission:<module>:<action>, e.g. Permission:Sales:Create")
    )]
    MalformedPolicyKey(String),

    #[error("Failed to load grant file `{path}`")]
    #[diagnostic(
        code(pos_authz::authz::grant_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    GrantLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid grant: {0}")]
    #[diagnostic(
        code(pos_authz::authz::invalid_grant),
        help("Grant files contain `role \"name\" {{ ... }}` and `principal \"id\" {{ ... }}` nodes with `module \"Slug\" {{ - \"View\" }}` children")
    )]
    InvalidGrant(String),

    #[error("Undefined role `{0}`")]
    #[diagnostic(
        code(pos_authz::authz::undefined_role),
        help("Define the role with: role \"<name>\" {{ module \"<Slug>\" {{ - \"View\" }} }}")
    )]
    UndefinedRole(String),

    #[error("Cyclic role inheritance detected: {0}")]
    #[diagnostic(
        code(pos_authz::authz::cyclic_roles),
        help("Check the `includes` lists in your role definitions for circular references")
    )]
    CyclicRoleInheritance(String),

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(pos_authz::authz::kdl_parse),
        help("Check your KDL file syntax, see https://kdl.dev for the specification")
    )]
    KdlParse(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(pos_authz::authz::io))]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        match &self {
            AuthzError::InvalidArgument(_)
            | AuthzError::MalformedPolicyKey(_)
            | AuthzError::InvalidGrant(_) => {
                let body = json!({ "error": self.to_string() });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            _ => {
                let body = json!({ "error": self.to_string() });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_input_is_400() {
        let resp = AuthzError::MalformedPolicyKey("Permission:Sales".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_load_errors_are_internal() {
        let resp = AuthzError::CyclicRoleInheritance("a -> b".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
