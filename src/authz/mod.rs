pub mod errors;
pub mod loader;
pub mod policy;
pub mod provider;
pub mod resolver;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use types::GrantSet;

/// Compiled grants for every known principal, loaded from KDL grant files.
/// Immutable after construction; a reload builds a new directory.
#[derive(Debug, Default)]
pub struct GrantDirectory {
    /// principal id -> flattened grant set (roles + direct grants)
    pub principals: HashMap<String, Arc<GrantSet>>,
    pub role_count: usize,
}

impl GrantDirectory {
    pub fn grants_for(&self, principal_id: &str) -> Option<Arc<GrantSet>> {
        self.principals.get(principal_id).cloned()
    }
}
