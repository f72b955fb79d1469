//! Request pipeline for protected operations.
//!
//! Operations are registered explicitly at startup together with the access
//! they require. [`Pipeline::dispatch`] runs, in order:
//!
//! 1. authorization (for operations registered with [`Access::Require`])
//! 2. input validation ([`Operation::validate`])
//! 3. the registered [`Handler`]
//!
//! A request rejected by a stage is never observed by a later one.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::authz::errors::AuthzError;
use crate::authz::resolver;
use crate::authz::types::{DenyReason, GrantSet, PermissionDeclaration, PolicyEvaluation};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("No handler registered for operation `{0}`")]
    #[diagnostic(
        code(pos_authz::pipeline::not_registered),
        help("Register the operation with PipelineBuilder::register before dispatching it")
    )]
    NotRegistered(&'static str),

    #[error("Operation `{0}` is registered more than once")]
    #[diagnostic(code(pos_authz::pipeline::duplicate_registration))]
    DuplicateRegistration(&'static str),

    #[error("Operation `{operation}` denied: {reason}")]
    #[diagnostic(code(pos_authz::pipeline::unauthorized))]
    Unauthorized {
        operation: &'static str,
        reason: DenyReason,
    },

    #[error("Validation failed for {} field(s)", .0.len())]
    #[diagnostic(code(pos_authz::pipeline::validation))]
    Validation(Vec<FieldError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Authz(#[from] AuthzError),

    #[error("Handler failed: {0}")]
    #[diagnostic(code(pos_authz::pipeline::handler))]
    Handler(String),
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        match self {
            PipelineError::Unauthorized { operation, reason } => {
                let status = match reason {
                    DenyReason::Unauthenticated => StatusCode::UNAUTHORIZED,
                    _ => StatusCode::FORBIDDEN,
                };
                let body = json!({
                    "error": "forbidden",
                    "operation": operation,
                    "reason": reason.as_str(),
                });
                (status, Json(body)).into_response()
            }
            PipelineError::Validation(fields) => {
                let body = json!({ "error": "validation failed", "fields": fields });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            PipelineError::Authz(e) => e.into_response(),
            other => {
                let body = json!({ "error": other.to_string() });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

/// Access required to dispatch an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// No authorization stage; validation and the handler still run.
    Public,
    Require(PermissionDeclaration),
}

/// An authenticated actor and the grant snapshot taken for this request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub grants: Arc<GrantSet>,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: u64,
    principal: Option<Principal>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self {
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            principal: None,
        }
    }

    pub fn authenticated(id: impl Into<String>, grants: Arc<GrantSet>) -> Self {
        Self {
            principal: Some(Principal {
                id: id.into(),
                grants,
            }),
            ..Self::anonymous()
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }
}

pub trait Operation: Send + 'static {
    /// Unique name, used in logs, errors and the declaration table.
    const NAME: &'static str;
    type Output: Send + 'static;

    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Ok(())
    }
}

#[async_trait]
pub trait Handler<O: Operation>: Send + Sync + 'static {
    async fn handle(&self, op: O, ctx: &RequestContext) -> Result<O::Output, PipelineError>;
}

/// Lets one handler value serve several operations.
#[async_trait]
impl<O: Operation, H: Handler<O>> Handler<O> for Arc<H> {
    async fn handle(&self, op: O, ctx: &RequestContext) -> Result<O::Output, PipelineError> {
        (**self).handle(op, ctx).await
    }
}

struct Registration<O: Operation> {
    access: Access,
    handler: Arc<dyn Handler<O>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclarationInfo {
    pub operation: &'static str,
    /// `None` for public operations
    pub policy_key: Option<String>,
}

#[derive(Default)]
pub struct PipelineBuilder {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    catalog: BTreeMap<&'static str, Access>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<O, H>(mut self, access: Access, handler: H) -> Result<Self, PipelineError>
    where
        O: Operation,
        H: Handler<O>,
    {
        let type_id = TypeId::of::<O>();
        if self.entries.contains_key(&type_id) || self.catalog.contains_key(O::NAME) {
            return Err(PipelineError::DuplicateRegistration(O::NAME));
        }
        self.catalog.insert(O::NAME, access.clone());
        let registration = Registration::<O> {
            access,
            handler: Arc::new(handler),
        };
        self.entries.insert(type_id, Box::new(registration));
        Ok(self)
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            entries: Arc::new(self.entries),
            catalog: Arc::new(self.catalog),
        }
    }
}

/// Immutable operation table shared by all requests.
#[derive(Clone)]
pub struct Pipeline {
    entries: Arc<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    catalog: Arc<BTreeMap<&'static str, Access>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub async fn dispatch<O: Operation>(
        &self,
        op: O,
        ctx: &RequestContext,
    ) -> Result<O::Output, PipelineError> {
        let registration = self
            .entries
            .get(&TypeId::of::<O>())
            .and_then(|entry| entry.downcast_ref::<Registration<O>>())
            .ok_or(PipelineError::NotRegistered(O::NAME))?;

        authorize(O::NAME, &registration.access, ctx)?;
        op.validate().map_err(PipelineError::Validation)?;

        tracing::debug!(
            operation = O::NAME,
            request_id = ctx.request_id(),
            "dispatching operation"
        );
        registration.handler.handle(op, ctx).await
    }

    pub fn declarations(&self) -> Vec<DeclarationInfo> {
        self.catalog
            .iter()
            .map(|(name, access)| DeclarationInfo {
                operation: *name,
                policy_key: match access {
                    Access::Public => None,
                    Access::Require(decl) => Some(decl.policy_key().to_string()),
                },
            })
            .collect()
    }
}

fn authorize(
    operation: &'static str,
    access: &Access,
    ctx: &RequestContext,
) -> Result<(), PipelineError> {
    let Access::Require(declaration) = access else {
        return Ok(());
    };

    let (principal_id, evaluation) = match ctx.principal() {
        Some(principal) => (
            principal.id.as_str(),
            resolver::evaluate(declaration.policy_key(), &principal.grants),
        ),
        None => ("", PolicyEvaluation::deny(DenyReason::Unauthenticated)),
    };
    if evaluation.allowed {
        return Ok(());
    }

    let reason = evaluation.reason.unwrap_or(DenyReason::ModuleNotGranted);
    tracing::warn!(
        operation,
        request_id = ctx.request_id(),
        principal = principal_id,
        policy_key = declaration.policy_key(),
        %reason,
        "authorization denied"
    );
    Err(PipelineError::Unauthorized { operation, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::types::Action;
    use std::sync::atomic::AtomicUsize;

    struct CreateSale {
        amount_cents: i64,
    }

    impl Operation for CreateSale {
        const NAME: &'static str = "CreateSale";
        type Output = i64;

        fn validate(&self) -> Result<(), Vec<FieldError>> {
            if self.amount_cents <= 0 {
                return Err(vec![FieldError::new("amount_cents", "must be positive")]);
            }
            Ok(())
        }
    }

    struct Ping;

    impl Operation for Ping {
        const NAME: &'static str = "Ping";
        type Output = &'static str;
    }

    #[derive(Clone, Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<CreateSale> for Counting {
        async fn handle(&self, op: CreateSale, _ctx: &RequestContext) -> Result<i64, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(op.amount_cents)
        }
    }

    #[async_trait]
    impl Handler<Ping> for Counting {
        async fn handle(&self, _op: Ping, _ctx: &RequestContext) -> Result<&'static str, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("pong")
        }
    }

    /// Validation that counts how often it runs.
    struct Audited {
        validations: Arc<AtomicUsize>,
    }

    impl Operation for Audited {
        const NAME: &'static str = "Audited";
        type Output = ();

        fn validate(&self) -> Result<(), Vec<FieldError>> {
            self.validations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Handler<Audited> for Counting {
        async fn handle(&self, _op: Audited, _ctx: &RequestContext) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sales_create() -> Access {
        Access::Require(PermissionDeclaration::new("Sales", Action::Create).unwrap())
    }

    fn pipeline(handler: &Counting) -> Pipeline {
        Pipeline::builder()
            .register::<CreateSale, _>(sales_create(), handler.clone())
            .unwrap()
            .register::<Ping, _>(Access::Public, handler.clone())
            .unwrap()
            .register::<Audited, _>(sales_create(), handler.clone())
            .unwrap()
            .build()
    }

    fn cashier() -> RequestContext {
        RequestContext::authenticated(
            "alice",
            Arc::new(GrantSet::new().with("Sales", &[Action::View, Action::Create])),
        )
    }

    #[tokio::test]
    async fn test_allowed_request_reaches_handler() {
        let handler = Counting::default();
        let p = pipeline(&handler);
        let out = p.dispatch(CreateSale { amount_cents: 250 }, &cashier()).await.unwrap();
        assert_eq!(out, 250);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_request_short_circuits() {
        let handler = Counting::default();
        let p = pipeline(&handler);
        let viewer = RequestContext::authenticated(
            "bob",
            Arc::new(GrantSet::new().with("Sales", &[Action::View])),
        );

        let err = p.dispatch(CreateSale { amount_cents: 250 }, &viewer).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Unauthorized {
                operation: "CreateSale",
                reason: DenyReason::ActionNotGranted
            }
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_authorization_precedes_validation() {
        let handler = Counting::default();
        let p = pipeline(&handler);
        let validations = Arc::new(AtomicUsize::new(0));
        let nobody = RequestContext::authenticated("carol", Arc::new(GrantSet::new()));

        let err = p
            .dispatch(Audited { validations: validations.clone() }, &nobody)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Unauthorized {
                reason: DenyReason::ModuleNotGranted,
                ..
            }
        ));
        assert_eq!(validations.load(Ordering::SeqCst), 0);

        // an invalid payload from an unauthorized caller is still an authorization failure
        let err = p.dispatch(CreateSale { amount_cents: -1 }, &nobody).await.unwrap_err();
        assert!(matches!(err, PipelineError::Unauthorized { .. }));

        p.dispatch(Audited { validations: validations.clone() }, &cashier())
            .await
            .unwrap();
        assert_eq!(validations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_skips_handler() {
        let handler = Counting::default();
        let p = pipeline(&handler);
        let err = p.dispatch(CreateSale { amount_cents: 0 }, &cashier()).await.unwrap_err();
        match err {
            PipelineError::Validation(fields) => {
                assert_eq!(fields, vec![FieldError::new("amount_cents", "must be positive")]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_anonymous_denied() {
        let handler = Counting::default();
        let p = pipeline(&handler);
        let err = p
            .dispatch(CreateSale { amount_cents: 1 }, &RequestContext::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Unauthorized {
                reason: DenyReason::Unauthenticated,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_public_operation_skips_authorization() {
        let handler = Counting::default();
        let p = pipeline(&handler);
        let out = p.dispatch(Ping, &RequestContext::anonymous()).await.unwrap();
        assert_eq!(out, "pong");
    }

    #[tokio::test]
    async fn test_unregistered_operation_fails_closed() {
        let handler = Counting::default();
        let p = Pipeline::builder()
            .register::<Ping, _>(Access::Public, handler.clone())
            .unwrap()
            .build();
        let err = p.dispatch(CreateSale { amount_cents: 1 }, &cashier()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotRegistered("CreateSale")));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let handler = Counting::default();
        let result = Pipeline::builder()
            .register::<Ping, _>(Access::Public, handler.clone())
            .unwrap()
            .register::<Ping, _>(sales_create(), handler);
        assert!(matches!(result, Err(PipelineError::DuplicateRegistration("Ping"))));
    }

    #[test]
    fn test_declarations_sorted_by_name() {
        let p = pipeline(&Counting::default());
        let decls = p.declarations();
        let names: Vec<_> = decls.iter().map(|d| d.operation).collect();
        assert_eq!(names, vec!["Audited", "CreateSale", "Ping"]);
        assert_eq!(decls[1].policy_key.as_deref(), Some("Permission:Sales:Create"));
        assert_eq!(decls[2].policy_key, None);
    }

    #[test]
    fn test_request_ids_are_distinct() {
        assert_ne!(
            RequestContext::anonymous().request_id(),
            RequestContext::anonymous().request_id()
        );
    }

    #[test]
    fn test_unauthorized_response_carries_reason() {
        let resp = PipelineError::Unauthorized {
            operation: "CreateSale",
            reason: DenyReason::ActionNotGranted,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = PipelineError::Validation(vec![]).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
