//! Login gate and per-session state.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spp_adapters::{NormalizedInput, SourceShape};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CredentialFile {
    users: Vec<Credential>,
}

/// Static username/password pairs loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    users: HashMap<String, String>,
}

impl Authenticator {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            users: credentials
                .into_iter()
                .map(|c| (c.username, c.password))
                .collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: CredentialFile = serde_yaml::from_str(text).context("parsing credential file")?;
        anyhow::ensure!(!file.users.is_empty(), "credential file lists no users");
        Ok(Self::new(file.users))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading credential file {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn login(&self, username: &str, password: &str) -> Option<AuthenticatedSession> {
        match self.users.get(username.trim()) {
            Some(expected) if expected == password => {
                let session = AuthenticatedSession::new(username.trim());
                info!(user = session.username(), session = %session.id(), "login accepted");
                Some(session)
            }
            _ => {
                warn!(user = username.trim(), "login rejected");
                None
            }
        }
    }
}

/// Proof that the caller passed the login gate. Only [`Authenticator::login`]
/// creates one; store writes take it by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedSession {
    id: Uuid,
    username: String,
    started_at: DateTime<Utc>,
}

impl AuthenticatedSession {
    fn new(username: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// An upload that was parsed but not yet fully written to the store.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    pub shape: SourceShape,
    pub inputs: Vec<NormalizedInput>,
    pub staged_at: DateTime<Utc>,
}

/// Everything one interactive session carries between requests.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session: AuthenticatedSession,
    staged: Option<StagedBatch>,
}

impl SessionContext {
    pub fn new(session: AuthenticatedSession) -> Self {
        Self { session, staged: None }
    }

    pub fn session(&self) -> &AuthenticatedSession {
        &self.session
    }

    /// Replaces any earlier upload.
    pub fn stage(&mut self, shape: SourceShape, inputs: Vec<NormalizedInput>) {
        self.staged = Some(StagedBatch {
            shape,
            inputs,
            staged_at: Utc::now(),
        });
    }

    pub fn staged(&self) -> Option<&StagedBatch> {
        self.staged.as_ref()
    }

    pub fn clear_staged(&mut self) -> Option<StagedBatch> {
        self.staged.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH: &str = "users:\n  - username: user3\n    password: password123\n  - username: admin\n    password: adminpass\n";

    #[test]
    fn static_credentials_gate_login() {
        let auth = Authenticator::from_yaml_str(AUTH).unwrap();
        assert_eq!(auth.user_count(), 2);
        let session = auth.login("user3", "password123").expect("valid login");
        assert_eq!(session.username(), "user3");
        assert!(auth.login("user3", "wrong").is_none());
        assert!(auth.login("nobody", "password123").is_none());
    }

    #[test]
    fn sessions_are_distinct() {
        let auth = Authenticator::from_yaml_str(AUTH).unwrap();
        let a = auth.login("admin", "adminpass").unwrap();
        let b = auth.login("admin", "adminpass").unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn empty_credential_file_is_rejected() {
        assert!(Authenticator::from_yaml_str("users: []\n").is_err());
        assert!(Authenticator::from_yaml_str("nope").is_err());
    }

    #[test]
    fn shipped_credentials_load() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/auth.yaml");
        let auth = Authenticator::from_yaml_file(path).unwrap();
        assert!(auth.login("admin", "adminpass").is_some());
    }

    #[test]
    fn context_caches_one_upload() {
        let auth = Authenticator::from_yaml_str(AUTH).unwrap();
        let mut ctx = SessionContext::new(auth.login("user3", "password123").unwrap());
        assert!(ctx.staged().is_none());
        ctx.stage(SourceShape::RawCsv, Vec::new());
        ctx.stage(SourceShape::SurveyLikert, Vec::new());
        assert_eq!(ctx.staged().map(|b| b.shape), Some(SourceShape::SurveyLikert));
        assert!(ctx.clear_staged().is_some());
        assert!(ctx.staged().is_none());
    }
}
