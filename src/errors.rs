use miette::Diagnostic;
use thiserror::Error;

use crate::authz::errors::AuthzError;
use crate::pipeline::PipelineError;

#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(pos_authz::io))]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Authz(#[from] AuthzError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Invalid listen address `{0}`")]
    #[diagnostic(
        code(pos_authz::bad_address),
        help("Set server.host and server.port, e.g. POS_AUTHZ__SERVER__PORT=9090")
    )]
    BadAddress(String),

    #[error("Invalid principal header `{0}`")]
    #[diagnostic(code(pos_authz::bad_header))]
    BadHeader(String),
}
