//! Operations served by the authorization service itself, and the startup
//! registration table that wires them into the [`Pipeline`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::authz::provider::{GrantProvider, StaticGrantProvider};
use crate::authz::resolver;
use crate::authz::types::{Action, CheckResponse, DenyReason, GrantSet, PermissionDeclaration};
use crate::errors::AppError;
use crate::pipeline::{Access, FieldError, Handler, Operation, Pipeline, PipelineError, RequestContext};

// Module slugs guarding the service's own operations
pub const USERS_MODULE: &str = "Users";
pub const SETTINGS_MODULE: &str = "Settings";

const MAX_PRINCIPAL_ID_LEN: usize = 128;

fn validate_principal_id(field: &str, id: &str, errors: &mut Vec<FieldError>) {
    if id.trim().is_empty() {
        errors.push(FieldError::new(field, "must not be empty"));
    } else if id.len() > MAX_PRINCIPAL_ID_LEN {
        errors.push(FieldError::new(
            field,
            format!("must be at most {MAX_PRINCIPAL_ID_LEN} bytes"),
        ));
    } else if id.chars().any(char::is_whitespace) {
        errors.push(FieldError::new(field, "must not contain whitespace"));
    }
}

fn into_result(errors: Vec<FieldError>) -> Result<(), Vec<FieldError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Grants of the calling principal, for gating UI elements.
pub struct MyPermissions;

impl Operation for MyPermissions {
    const NAME: &'static str = "MyPermissions";
    type Output = GrantSet;
}

/// Grants of an arbitrary principal.
pub struct GetPrincipalGrants {
    pub principal_id: String,
}

impl Operation for GetPrincipalGrants {
    const NAME: &'static str = "GetPrincipalGrants";
    type Output = GrantSet;

    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        validate_principal_id("principal_id", &self.principal_id, &mut errors);
        into_result(errors)
    }
}

/// Evaluate a policy key for another principal.
pub struct CheckPermission {
    pub principal: String,
    pub policy_key: String,
}

impl Operation for CheckPermission {
    const NAME: &'static str = "CheckPermission";
    type Output = CheckResponse;

    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        validate_principal_id("principal", &self.principal, &mut errors);
        if self.policy_key.is_empty() {
            errors.push(FieldError::new("policy_key", "must not be empty"));
        }
        into_result(errors)
    }
}

/// Re-read the grant files from disk.
pub struct ReloadGrants;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub principals: usize,
    pub roles: usize,
}

impl Operation for ReloadGrants {
    const NAME: &'static str = "ReloadGrants";
    type Output = ReloadSummary;
}

pub struct GrantQueries {
    provider: Arc<dyn GrantProvider>,
}

impl GrantQueries {
    async fn lookup(&self, principal_id: &str) -> Result<GrantSet, PipelineError> {
        let grants = self.provider.grants_for(principal_id).await?;
        Ok(grants.map(|g| (*g).clone()).unwrap_or_default())
    }
}

#[async_trait]
impl Handler<MyPermissions> for GrantQueries {
    async fn handle(&self, _op: MyPermissions, ctx: &RequestContext) -> Result<GrantSet, PipelineError> {
        match ctx.principal() {
            Some(principal) => Ok((*principal.grants).clone()),
            None => Err(PipelineError::Unauthorized {
                operation: MyPermissions::NAME,
                reason: DenyReason::Unauthenticated,
            }),
        }
    }
}

#[async_trait]
impl Handler<GetPrincipalGrants> for GrantQueries {
    async fn handle(
        &self,
        op: GetPrincipalGrants,
        _ctx: &RequestContext,
    ) -> Result<GrantSet, PipelineError> {
        self.lookup(&op.principal_id).await
    }
}

#[async_trait]
impl Handler<CheckPermission> for GrantQueries {
    async fn handle(
        &self,
        op: CheckPermission,
        _ctx: &RequestContext,
    ) -> Result<CheckResponse, PipelineError> {
        let grants = self.lookup(&op.principal).await?;
        Ok(resolver::evaluate(&op.policy_key, &grants).into())
    }
}

pub struct GrantAdmin {
    provider: Arc<StaticGrantProvider>,
}

#[async_trait]
impl Handler<ReloadGrants> for GrantAdmin {
    async fn handle(&self, _op: ReloadGrants, ctx: &RequestContext) -> Result<ReloadSummary, PipelineError> {
        let directory = self.provider.reload().await.map_err(|e| {
            tracing::error!(error = %e, "grant reload failed, keeping previous grants");
            PipelineError::Handler(e.to_string())
        })?;
        tracing::info!(
            principal = ctx.principal().map(|p| p.id.as_str()).unwrap_or_default(),
            principals = directory.principals.len(),
            "grants reloaded"
        );
        Ok(ReloadSummary {
            principals: directory.principals.len(),
            roles: directory.role_count,
        })
    }
}

/// Build the operation table. A mis-declared permission fails startup.
pub fn build_pipeline(provider: Arc<StaticGrantProvider>) -> Result<Pipeline, AppError> {
    let users_view = PermissionDeclaration::new(USERS_MODULE, Action::View)?;
    let settings_edit = PermissionDeclaration::new(SETTINGS_MODULE, Action::Edit)?;

    let queries = Arc::new(GrantQueries {
        provider: provider.clone(),
    });

    let pipeline = Pipeline::builder()
        .register::<MyPermissions, _>(Access::Public, queries.clone())?
        .register::<GetPrincipalGrants, _>(Access::Require(users_view.clone()), queries.clone())?
        .register::<CheckPermission, _>(Access::Require(users_view), queries)?
        .register::<ReloadGrants, _>(Access::Require(settings_edit), GrantAdmin { provider })?
        .build();

    for decl in pipeline.declarations() {
        tracing::debug!(
            operation = decl.operation,
            policy_key = decl.policy_key.as_deref().unwrap_or("public"),
            "registered operation"
        );
    }
    Ok(pipeline)
}
