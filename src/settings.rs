use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub grants: Grants,
    pub identity: Identity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grants {
    /// Directory holding the `.kdl` grant files. Default: grants
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Header carrying the authenticated principal id, set by the upstream
    /// identity proxy. Requests without it are anonymous.
    pub principal_header: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for Grants {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("grants"),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            principal_header: "x-principal-id".to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)
            .into_diagnostic()?
            .set_default("server.port", Server::default().port)
            .into_diagnostic()?
            .set_default(
                "grants.dir",
                Grants::default().dir.to_string_lossy().to_string(),
            )
            .into_diagnostic()?
            .set_default(
                "identity.principal_header",
                Identity::default().principal_header,
            )
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: POS_AUTHZ__SERVER__PORT=9090, etc.
        builder = builder.add_source(config::Environment::with_prefix("POS_AUTHZ").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let mut s: Settings = cfg.try_deserialize().into_diagnostic()?;

        if s.grants.dir.is_relative() {
            s.grants.dir = std::env::current_dir().into_diagnostic()?.join(&s.grants.dir);
        }
        s.identity.principal_header = s.identity.principal_header.to_ascii_lowercase();

        Ok(s)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
