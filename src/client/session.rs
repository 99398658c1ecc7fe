use std::sync::Arc;

use chrono::Utc;

use super::error::ClientError;
use super::storage::LocalStore;
use crate::models::session::{SESSION_META_COOKIE, SessionMetadata};
use crate::sync::store::Store;

/// What the dashboard knows about the signed-in user.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuthState {
    pub authenticated: bool,
    pub region: Option<String>,
    pub vin: Option<String>,
    pub user_id: Option<String>,
    /// Set when a session ended underneath the user and they must sign in.
    pub login_required: bool,
}

/// Client half of the session: the persisted [`SessionMetadata`] record and
/// the auth state derived from it.
///
/// Several managers may share one [`LocalStore`] (one per open view). A
/// change made by one is picked up by the others through
/// [`SessionManager::handle_storage_event`].
pub struct SessionManager {
    storage: Arc<dyn LocalStore>,
    auth: Store<AuthState>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn LocalStore>) -> Self {
        let manager = Self {
            storage,
            auth: Store::default(),
        };
        manager.sync_auth_state();
        manager
    }

    pub fn auth(&self) -> &Store<AuthState> {
        &self.auth
    }

    /// Loads the stored record. Expired or unreadable records are purged.
    pub fn restore_session(&self) -> Option<SessionMetadata> {
        let raw = self.storage.get(SESSION_META_COOKIE)?;

        let Ok(metadata) = sonic_rs::from_str::<SessionMetadata>(&raw) else {
            tracing::warn!("⚠️ Stored session is unreadable, purging it");
            self.storage.remove(SESSION_META_COOKIE);
            return None;
        };

        if metadata.is_expired(Utc::now()) {
            tracing::info!("⌛ Stored session expired at {}, purging it", metadata.expires_at);
            self.storage.remove(SESSION_META_COOKIE);
            return None;
        }

        Some(metadata)
    }

    pub fn save(&self, metadata: &SessionMetadata) -> Result<(), ClientError> {
        let raw = sonic_rs::to_string(metadata).map_err(|e| ClientError::Storage(e.to_string()))?;
        self.storage.set(SESSION_META_COOKIE, &raw)?;
        self.sync_auth_state();
        Ok(())
    }

    /// Records the vehicle and vendor user the session is working with.
    pub fn set_active_vehicle(
        &self,
        vin: Option<String>,
        user_id: Option<String>,
    ) -> Result<(), ClientError> {
        let Some(mut metadata) = self.restore_session() else {
            return Ok(());
        };
        metadata.vin = vin;
        if user_id.is_some() {
            metadata.user_id = user_id;
        }
        self.save(&metadata)
    }

    /// Removes the record after a deliberate sign-out.
    pub fn clear(&self) {
        self.storage.remove(SESSION_META_COOKIE);
        self.sync_auth_state();
    }

    /// Removes the record because the vendor no longer honours the session.
    pub fn expire(&self) {
        self.storage.remove(SESSION_META_COOKIE);
        self.auth.set(AuthState {
            login_required: true,
            ..AuthState::default()
        });
    }

    /// Re-derives the auth state when another view changed `key`.
    pub fn handle_storage_event(&self, key: &str) {
        if key == SESSION_META_COOKIE {
            tracing::debug!("🔄 Session record changed elsewhere, resyncing");
            self.sync_auth_state();
        }
    }

    /// Publishes the auth state implied by the stored record and returns
    /// whether it is authenticated.
    pub fn sync_auth_state(&self) -> bool {
        let next = match self.restore_session() {
            Some(metadata) => AuthState {
                authenticated: true,
                region: Some(metadata.region),
                vin: metadata.vin,
                user_id: metadata.user_id,
                login_required: false,
            },
            None => AuthState::default(),
        };
        let authenticated = next.authenticated;
        self.auth.set(next);
        authenticated
    }
}
