//! pos-authz - module/action permission authorization for the POS backend
//!
//! Operations declare the (module, action) permission they need, the
//! resolver evaluates the resulting policy key against a principal's grant
//! set, and the pipeline runs authorization before validation and the handler.

pub mod authz;
pub mod errors;
pub mod operations;
pub mod pipeline;
pub mod settings;
pub mod web;
