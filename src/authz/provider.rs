//! Source of principal grant sets.
//!
//! Grant sets belong to the identity/session side of the system; the
//! authorization core only reads them through [`GrantProvider`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::authz::errors::AuthzError;
use crate::authz::loader::load_grants;
use crate::authz::types::GrantSet;
use crate::authz::GrantDirectory;

#[async_trait]
pub trait GrantProvider: Send + Sync {
    /// Current grants of an authenticated principal, `None` if unknown.
    async fn grants_for(&self, principal_id: &str) -> Result<Option<Arc<GrantSet>>, AuthzError>;
}

/// Serves grants from compiled KDL grant files.
pub struct StaticGrantProvider {
    directory: RwLock<Arc<GrantDirectory>>,
    source: Option<PathBuf>,
}

impl StaticGrantProvider {
    pub fn new(directory: GrantDirectory) -> Self {
        Self {
            directory: RwLock::new(Arc::new(directory)),
            source: None,
        }
    }

    /// Load grant files from `dir` and remember it for [`StaticGrantProvider::reload`].
    pub fn from_dir(dir: &Path) -> Result<Self, AuthzError> {
        let directory = load_grants(dir)?;
        Ok(Self {
            directory: RwLock::new(Arc::new(directory)),
            source: Some(dir.to_path_buf()),
        })
    }

    pub async fn snapshot(&self) -> Arc<GrantDirectory> {
        self.directory.read().await.clone()
    }

    /// Recompile the grant directory and swap it in. On error the previous
    /// snapshot stays active.
    pub async fn reload(&self) -> Result<Arc<GrantDirectory>, AuthzError> {
        let Some(dir) = &self.source else {
            return Err(AuthzError::InvalidGrant(
                "grant provider was not loaded from a directory".into(),
            ));
        };
        let fresh = Arc::new(load_grants(dir)?);
        *self.directory.write().await = fresh.clone();
        Ok(fresh)
    }
}

#[async_trait]
impl GrantProvider for StaticGrantProvider {
    async fn grants_for(&self, principal_id: &str) -> Result<Option<Arc<GrantSet>>, AuthzError> {
        Ok(self.snapshot().await.grants_for(principal_id))
    }
}
