/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Per-user registration profiles and the stores that hold them.
//!
//! Profiles are JSON documents keyed by LINE user id. Writes are partial
//! (merge) upserts: only the fields present in a [`ProfileUpdate`] change.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use dpisline_config::PostgresConfig;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    #[default]
    NotStarted,
    WaitingForName,
    WaitingForDept,
    Done,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserProfile {
    #[serde(default)]
    pub state: Option<RegistrationState>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(rename = "isVerified", default)]
    pub is_verified: bool,
}

impl UserProfile {
    /// Recorded state, with a missing state read as `NotStarted`.
    pub fn state(&self) -> RegistrationState {
        self.state.unwrap_or_default()
    }

    /// Merge `update` into this profile, overwriting only the fields it sets.
    pub fn apply(&mut self, update: &ProfileUpdate) {
        if let Some(state) = update.state {
            self.state = Some(state);
        }
        if let Some(ref name) = update.name {
            self.name = Some(name.clone());
        }
        if let Some(ref department) = update.department {
            self.department = Some(department.clone());
        }
        if let Some(verified) = update.is_verified {
            self.is_verified = verified;
        }
    }
}

/// Partial profile document. Serializes to exactly the fields being written,
/// which is what the Postgres store merges with `||`.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<RegistrationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(rename = "isVerified", skip_serializing_if = "Option::is_none")]
    pub is_verified: Option<bool>,
}

impl ProfileUpdate {
    /// (Re)start registration: ask for the user's name.
    pub fn start() -> Self {
        Self {
            state: Some(RegistrationState::WaitingForName),
            is_verified: Some(false),
            ..Self::default()
        }
    }

    /// Record the full name and move on to department selection.
    pub fn named(name: &str) -> Self {
        Self {
            state: Some(RegistrationState::WaitingForDept),
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// Record the confirmed department; registration is complete.
    pub fn verified(department: &str) -> Self {
        Self {
            state: Some(RegistrationState::Done),
            department: Some(department.to_string()),
            is_verified: Some(true),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("profile document error: {0}")]
    Document(#[from] serde_json::Error),
}

/// Key-value store of user profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// `None` when the user has never been seen.
    async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError>;

    /// Create or merge-update the profile for `user_id`.
    async fn update_user_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), StoreError>;

    /// Cheap reachability check for `/health`.
    async fn ping(&self) -> bool;

    fn kind(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store. Profiles are lost on restart.
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }

    async fn update_user_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), StoreError> {
        let mut guard = self.profiles.write().await;
        guard.entry(user_id.to_string()).or_default().apply(update);
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS user_profiles (
    user_id    TEXT PRIMARY KEY,
    profile    JSONB NOT NULL DEFAULT '{}'::jsonb,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)";

const UPSERT_SQL: &str = "INSERT INTO user_profiles (user_id, profile, updated_at)
     VALUES ($1, $2, NOW())
     ON CONFLICT (user_id) DO UPDATE
     SET profile = user_profiles.profile || EXCLUDED.profile,
         updated_at = NOW()";

/// Profiles as JSONB documents in a single `user_profiles` table.
pub struct PgProfileStore {
    pg: PgPool,
}

/// Connect options for `cfg`. The password is passed as-is, so characters
/// such as `@`, `/` or `:` need no escaping.
pub fn connect_options(cfg: &PostgresConfig, password: &str) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&cfg.host)
        .port(cfg.port)
        .database(&cfg.database)
        .username(&cfg.user)
        .password(password)
}

impl PgProfileStore {
    /// Connect and create the table if it does not exist yet.
    pub async fn connect(
        options: PgConnectOptions,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pg = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_TABLE_SQL).execute(&pg).await?;
        info!(max_connections, "profile store ready (postgres)");
        Ok(Self { pg })
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query_as::<_, (serde_json::Value,)>(
            "SELECT profile FROM user_profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pg)
        .await?;

        match row {
            Some((doc,)) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn update_user_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), StoreError> {
        let doc = serde_json::to_value(update)?;
        sqlx::query(UPSERT_SQL)
            .bind(user_id)
            .bind(doc)
            .execute(&self.pg)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pg).await.is_ok()
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_document_field_names() {
        let profile = UserProfile {
            state: Some(RegistrationState::WaitingForDept),
            name: Some("สมชาย ใจดี".to_string()),
            department: None,
            is_verified: false,
        };
        let doc = serde_json::to_value(&profile).unwrap();
        assert_eq!(doc["state"], "waiting_for_dept");
        assert_eq!(doc["name"], "สมชาย ใจดี");
        assert_eq!(doc["isVerified"], false);
    }

    #[test]
    fn test_missing_state_reads_as_not_started() {
        let profile: UserProfile = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(profile.state, None);
        assert_eq!(profile.state(), RegistrationState::NotStarted);
        assert!(!profile.is_verified);
    }

    #[test]
    fn test_update_serializes_only_set_fields() {
        let doc = serde_json::to_value(ProfileUpdate::named("สมหญิง รักดี")).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({ "state": "waiting_for_dept", "name": "สมหญิง รักดี" })
        );

        let doc = serde_json::to_value(ProfileUpdate::verified("กรมสรรพากร")).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({ "state": "done", "department": "กรมสรรพากร", "isVerified": true })
        );
    }

    #[test]
    fn test_connect_options_keep_password_out_of_host() {
        let cfg = PostgresConfig {
            host: "db.internal".to_string(),
            port: 5433,
            database: "profiles".to_string(),
            user: "bot".to_string(),
            password_env: "UNUSED".to_string(),
            max_connections: 2,
        };
        let opts = connect_options(&cfg, "p@ss/w:rd@evil:1/x");
        assert_eq!(opts.get_host(), "db.internal");
        assert_eq!(opts.get_port(), 5433);
        assert_eq!(opts.get_database(), Some("profiles"));
        assert_eq!(opts.get_username(), "bot");
    }

    #[tokio::test]
    async fn test_memory_store_unknown_user() {
        let store = MemoryProfileStore::new();
        assert_eq!(store.get_user_profile("U-none").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_merges_updates() {
        let store = MemoryProfileStore::new();
        store
            .update_user_profile("U1", &ProfileUpdate::start())
            .await
            .unwrap();
        store
            .update_user_profile("U1", &ProfileUpdate::named("สมชาย ใจดี"))
            .await
            .unwrap();

        let profile = store.get_user_profile("U1").await.unwrap().unwrap();
        assert_eq!(profile.state(), RegistrationState::WaitingForDept);
        assert_eq!(profile.name.as_deref(), Some("สมชาย ใจดี"));
        assert!(!profile.is_verified, "isVerified from the first write survives");

        store
            .update_user_profile("U1", &ProfileUpdate::verified("กรมศุลกากร"))
            .await
            .unwrap();
        let profile = store.get_user_profile("U1").await.unwrap().unwrap();
        assert_eq!(profile.name.as_deref(), Some("สมชาย ใจดี"), "name kept after merge");
        assert_eq!(profile.department.as_deref(), Some("กรมศุลกากร"));
        assert!(profile.is_verified);
        assert_eq!(profile.state(), RegistrationState::Done);
    }

    #[tokio::test]
    async fn test_memory_store_isolates_users() {
        let store = MemoryProfileStore::new();
        store
            .update_user_profile("U1", &ProfileUpdate::verified("กรมปศุสัตว์"))
            .await
            .unwrap();
        assert_eq!(store.get_user_profile("U2").await.unwrap(), None);
        assert!(store.ping().await);
        assert_eq!(store.kind(), "memory");
    }
}
