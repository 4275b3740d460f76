//! Decides the fate of a `CONNECTION_REQUEST`.
//!
//! Bad credentials, duplicate accounts and version mismatches are ordinary
//! outcomes and come back as [`AuthOutcome::Denied`]. Credential store
//! failures are logged and reported to the client as a generic
//! `INCORRECT_CREDENTIALS` denial.

use std::sync::Arc;

use tracing::{debug, info, warn};

use parley_shared::commands::{ConnectionRequest, Credentials};
use parley_shared::crypto::guest_username;
use parley_shared::ReasonCode;
use parley_store::{CredentialStore, SignUpOutcome, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated { username: String },
    Denied { reason: ReasonCode },
}

impl AuthOutcome {
    fn denied(reason: ReasonCode) -> Self {
        Self::Denied { reason }
    }
}

pub async fn authenticate(store: &Arc<CredentialStore>, request: ConnectionRequest) -> AuthOutcome {
    if !request.is_compatible() {
        debug!(version = %request.version, "Rejecting incompatible client");
        return AuthOutcome::denied(ReasonCode::IncompatibleClient);
    }

    match request.credentials {
        Credentials::Guest => AuthOutcome::Authenticated {
            username: guest_username(),
        },

        Credentials::SignUp {
            email,
            username,
            password,
        } => {
            let store = store.clone();
            let name = username.clone();
            let result =
                run_blocking(move || store.create(&email, &name, &password)).await;
            match result {
                Ok(SignUpOutcome::Created) => {
                    info!(username = %username, "Signed up");
                    AuthOutcome::Authenticated { username }
                }
                Ok(SignUpOutcome::AlreadyExists) => {
                    AuthOutcome::denied(ReasonCode::UsernameEmailAlreadyExists)
                }
                Err(e) => {
                    warn!(username = %username, error = %e, "Sign-up failed in credential store");
                    AuthOutcome::denied(ReasonCode::IncorrectCredentials)
                }
            }
        }

        Credentials::Login { username, password } => {
            let store = store.clone();
            let name = username.clone();
            let result = run_blocking(move || store.verify(&name, &password)).await;
            match result {
                Ok(true) => AuthOutcome::Authenticated { username },
                Ok(false) => {
                    debug!(username = %username, "Login refused");
                    AuthOutcome::denied(ReasonCode::IncorrectCredentials)
                }
                Err(e) => {
                    warn!(username = %username, error = %e, "Login failed in credential store");
                    AuthOutcome::denied(ReasonCode::IncorrectCredentials)
                }
            }
        }
    }
}

/// The store does synchronous file I/O; keep it off the async workers.
async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("credential task failed: {e}"),
        ))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::constants::GUEST_PREFIX;
    use tempfile::TempDir;

    fn store() -> (Arc<CredentialStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::open(dir.path().join("accounts.db")).unwrap();
        (Arc::new(store), dir)
    }

    fn sign_up(username: &str, email: &str) -> ConnectionRequest {
        ConnectionRequest::new(Credentials::SignUp {
            email: email.into(),
            username: username.into(),
            password: "pw".into(),
        })
    }

    #[tokio::test]
    async fn test_guest_gets_disposable_name() {
        let (store, _dir) = store();
        let outcome = authenticate(&store, ConnectionRequest::new(Credentials::Guest)).await;
        let AuthOutcome::Authenticated { username } = outcome else {
            panic!("guest must be accepted");
        };
        assert!(username.starts_with(GUEST_PREFIX));
        assert_eq!(username.len(), 21);
    }

    #[tokio::test]
    async fn test_version_mismatch_denied() {
        let (store, _dir) = store();
        let mut request = ConnectionRequest::new(Credentials::Guest);
        request.version = "parley/0.1".into();
        assert_eq!(
            authenticate(&store, request).await,
            AuthOutcome::Denied {
                reason: ReasonCode::IncompatibleClient
            }
        );
    }

    #[tokio::test]
    async fn test_sign_up_then_login() {
        let (store, _dir) = store();
        assert_eq!(
            authenticate(&store, sign_up("alice", "a@example.org")).await,
            AuthOutcome::Authenticated {
                username: "alice".into()
            }
        );

        let login = ConnectionRequest::new(Credentials::Login {
            username: "alice".into(),
            password: "pw".into(),
        });
        assert!(matches!(
            authenticate(&store, login).await,
            AuthOutcome::Authenticated { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_sign_up_denied() {
        let (store, _dir) = store();
        authenticate(&store, sign_up("alice", "a@example.org")).await;
        assert_eq!(
            authenticate(&store, sign_up("alice2", "a@example.org")).await,
            AuthOutcome::Denied {
                reason: ReasonCode::UsernameEmailAlreadyExists
            }
        );
    }

    #[tokio::test]
    async fn test_wrong_password_denied() {
        let (store, _dir) = store();
        authenticate(&store, sign_up("alice", "a@example.org")).await;
        let login = ConnectionRequest::new(Credentials::Login {
            username: "alice".into(),
            password: "nope".into(),
        });
        assert_eq!(
            authenticate(&store, login).await,
            AuthOutcome::Denied {
                reason: ReasonCode::IncorrectCredentials
            }
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_generic_denial() {
        let (store, dir) = store();
        std::fs::write(dir.path().join("accounts.db"), "garbage\n").unwrap();
        let login = ConnectionRequest::new(Credentials::Login {
            username: "alice".into(),
            password: "pw".into(),
        });
        assert_eq!(
            authenticate(&store, login).await,
            AuthOutcome::Denied {
                reason: ReasonCode::IncorrectCredentials
            }
        );
    }
}
