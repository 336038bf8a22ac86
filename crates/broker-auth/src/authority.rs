//! Leader-only lifecycle of the internal principals

use std::sync::Arc;

use tracing::{debug, error, info};

use broker_core::INTERNAL_USERS;
use broker_state::StateView;

use crate::backend::{AuthBackend, CommandOutcome};
use crate::error::{AuthError, AuthResult};
use crate::generate_password;

/// Whether a backend application went through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStatus {
    Applied,
    /// The backend was not reachable; retry on a later trigger
    Pending(String),
}

impl ApplyStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyStatus::Applied)
    }
}

/// Generates, stores, rotates and applies the internal credentials.
///
/// Every operation checks leadership first and fails with
/// [`AuthError::NotLeader`] before touching the store or the backend.
#[derive(Clone)]
pub struct CredentialAuthority {
    backend: Arc<dyn AuthBackend>,
}

impl CredentialAuthority {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn AuthBackend> {
        &self.backend
    }

    fn check(&self, view: &StateView, username: &str) -> AuthResult<()> {
        if !view.is_leader() {
            return Err(AuthError::NotLeader);
        }
        if !INTERNAL_USERS.contains(&username) {
            return Err(AuthError::UnknownPrincipal {
                username: username.to_string(),
                internal: INTERNAL_USERS.to_vec(),
            });
        }
        Ok(())
    }

    /// Generate and store a password for every internal principal lacking
    /// one. Returns the principals that got a new password.
    pub fn ensure_internal_credentials(&self, view: &StateView) -> AuthResult<Vec<String>> {
        if !view.is_leader() {
            return Err(AuthError::NotLeader);
        }

        let cluster = view.cluster();
        let mut generated = Vec::new();
        for user in INTERNAL_USERS {
            if cluster.internal_password(user).is_some() {
                continue;
            }
            cluster.set_internal_password(user, &generate_password())?;
            generated.push(user.to_string());
        }

        if !generated.is_empty() {
            info!("Generated internal credentials for {:?}", generated);
        }
        Ok(generated)
    }

    /// Create or update one internal SCRAM user on the backend
    pub async fn apply(
        &self,
        view: &StateView,
        zookeeper: &str,
        username: &str,
        password: &str,
    ) -> AuthResult<ApplyStatus> {
        self.check(view, username)?;

        match self.backend.upsert_user(zookeeper, username, password).await {
            CommandOutcome::Ready(_) => {
                debug!("Applied credentials for {}", username);
                Ok(ApplyStatus::Applied)
            }
            CommandOutcome::NotReadyYet(reason) => {
                // Adding users fails while the dependency is still coming up
                debug!("Backend not ready for {}: {}", username, reason);
                Ok(ApplyStatus::Pending(reason))
            }
            CommandOutcome::Failed(reason) => {
                error!("Failed to apply credentials for {}: {}", username, reason);
                Err(AuthError::Backend(reason))
            }
        }
    }

    /// Apply every stored internal credential, then set `credentials-ready`.
    ///
    /// Stops at the first principal the backend cannot take yet; the marker
    /// is only written once all of them went through.
    pub async fn apply_internal_credentials(
        &self,
        view: &StateView,
        zookeeper: &str,
    ) -> AuthResult<ApplyStatus> {
        self.ensure_internal_credentials(view)?;

        let cluster = view.cluster();
        for user in INTERNAL_USERS {
            let password = cluster
                .internal_password(user)
                .ok_or_else(|| AuthError::MissingPassword(user.to_string()))?;
            if let ApplyStatus::Pending(reason) = self.apply(view, zookeeper, user, &password).await? {
                return Ok(ApplyStatus::Pending(reason));
            }
        }

        if !cluster.credentials_ready() {
            cluster.mark_credentials_ready()?;
            info!("Internal credentials applied, marked {} ready", INTERNAL_USERS.join(", "));
        }
        Ok(ApplyStatus::Applied)
    }

    /// Replace an internal principal's password.
    ///
    /// Rejected if the new password equals any stored internal password. The
    /// backend is updated before the store, so a failed apply leaves the old
    /// password in place.
    pub async fn rotate(
        &self,
        view: &StateView,
        zookeeper: &str,
        username: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        self.check(view, username)?;

        let cluster = view.cluster();
        if cluster
            .internal_credentials()
            .values()
            .any(|existing| existing == new_password)
        {
            error!("Password already exists, please choose a different password.");
            return Err(AuthError::PasswordInUse);
        }

        match self.apply(view, zookeeper, username, new_password).await? {
            ApplyStatus::Applied => {
                cluster.set_internal_password(username, new_password)?;
                info!("Rotated password for {}", username);
                Ok(())
            }
            ApplyStatus::Pending(reason) => Err(AuthError::Unavailable(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use broker_state::{MemoryHost, StateStore, Topology};

    const ZK: &str = "1.1.1.1:2181/kafka";

    fn view(host: &Arc<MemoryHost>, node: &str) -> StateView {
        StateView::new(
            node,
            Arc::clone(host) as Arc<dyn StateStore>,
            Arc::clone(host) as Arc<dyn Topology>,
            host.leadership_for(node),
        )
    }

    fn setup() -> (Arc<MemoryHost>, Arc<MemoryBackend>, CredentialAuthority) {
        let host = Arc::new(MemoryHost::new());
        host.add_peer("kafka/0");
        host.add_peer("kafka/1");
        host.set_leader(Some("kafka/0"));
        let backend = Arc::new(MemoryBackend::new());
        let authority = CredentialAuthority::new(Arc::clone(&backend) as Arc<dyn AuthBackend>);
        (host, backend, authority)
    }

    #[test]
    fn test_ensure_internal_credentials_is_idempotent() {
        let (host, _, authority) = setup();
        let leader = view(&host, "kafka/0");

        let generated = authority.ensure_internal_credentials(&leader).unwrap();
        assert_eq!(generated, vec!["sync", "admin"]);
        let first = leader.cluster().internal_credentials();

        assert!(authority.ensure_internal_credentials(&leader).unwrap().is_empty());
        assert_eq!(leader.cluster().internal_credentials(), first);
        assert_eq!(first["sync"].len(), 32);
    }

    #[test]
    fn test_non_leader_is_rejected_without_side_effects() {
        let (host, _, authority) = setup();
        let follower = view(&host, "kafka/1");

        assert!(matches!(
            authority.ensure_internal_credentials(&follower),
            Err(AuthError::NotLeader)
        ));
        assert!(follower.cluster().internal_credentials().is_empty());
    }

    #[tokio::test]
    async fn test_apply_internal_credentials_sets_marker() {
        let (host, backend, authority) = setup();
        let leader = view(&host, "kafka/0");

        backend.set_available(false);
        let status = authority.apply_internal_credentials(&leader, ZK).await.unwrap();
        assert!(!status.is_applied());
        assert!(!leader.cluster().credentials_ready());

        backend.set_available(true);
        let status = authority.apply_internal_credentials(&leader, ZK).await.unwrap();
        assert!(status.is_applied());
        assert!(leader.cluster().credentials_ready());
        assert_eq!(
            backend.password_of("admin"),
            leader.cluster().internal_password("admin")
        );
    }

    #[tokio::test]
    async fn test_rotate_rejects_existing_password() {
        let (host, backend, authority) = setup();
        let leader = view(&host, "kafka/0");
        authority.ensure_internal_credentials(&leader).unwrap();
        let sync = leader.cluster().internal_password("sync").unwrap();
        let calls = backend.calls().upsert_user;

        let result = authority.rotate(&leader, ZK, "admin", &sync).await;
        assert!(matches!(result, Err(AuthError::PasswordInUse)));
        assert_eq!(backend.calls().upsert_user, calls);
    }

    #[tokio::test]
    async fn test_rotate_round_trip() {
        let (host, backend, authority) = setup();
        let leader = view(&host, "kafka/0");
        authority.ensure_internal_credentials(&leader).unwrap();

        authority.rotate(&leader, ZK, "admin", "mellon").await.unwrap();
        assert_eq!(leader.cluster().internal_password("admin").as_deref(), Some("mellon"));
        assert_eq!(backend.password_of("admin").as_deref(), Some("mellon"));
    }

    #[tokio::test]
    async fn test_rotate_unavailable_keeps_old_password() {
        let (host, backend, authority) = setup();
        let leader = view(&host, "kafka/0");
        authority.ensure_internal_credentials(&leader).unwrap();
        let before = leader.cluster().internal_password("sync");

        backend.set_available(false);
        let result = authority.rotate(&leader, ZK, "sync", "mellon").await;
        assert!(matches!(result, Err(ref e) if e.is_transient()));
        assert_eq!(leader.cluster().internal_password("sync"), before);
    }

    #[tokio::test]
    async fn test_rotate_rejects_unknown_principal_and_follower() {
        let (host, _, authority) = setup();

        let result = authority.rotate(&view(&host, "kafka/0"), ZK, "gandalf", "x").await;
        assert!(matches!(result, Err(AuthError::UnknownPrincipal { .. })));

        let result = authority.rotate(&view(&host, "kafka/1"), ZK, "admin", "x").await;
        assert!(matches!(result, Err(AuthError::NotLeader)));
    }
}
