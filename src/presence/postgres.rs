use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use super::{PresenceStore, StoreError};
use crate::models::{now_ms, AccountType, OnlineUser, PresenceRecord, Role};

/// Presence store backed by Postgres. Schema lives in `migrations/`; all
/// timestamps are stored as `BIGINT` milliseconds and roles as `TEXT[]`.
#[derive(Clone)]
pub struct PostgresPresenceStore {
    pool: PgPool,
}

impl PostgresPresenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    uuid: String,
    name: String,
    account_type: String,
    roles: Vec<String>,
    online: bool,
    last_join: Option<i64>,
    last_seen: Option<i64>,
    last_leave: Option<i64>,
}

impl From<UserRow> for PresenceRecord {
    fn from(row: UserRow) -> Self {
        PresenceRecord {
            uuid: row.uuid,
            name: row.name,
            account_type: AccountType::from_str(&row.account_type).unwrap_or_default(),
            roles: parse_roles(&row.roles),
            online: row.online,
            last_join: row.last_join,
            last_seen: row.last_seen,
            last_leave: row.last_leave,
        }
    }
}

/// Rows written by older deployments may carry role strings that have since
/// left the closed set; those entries are dropped on read.
fn parse_roles(raw: &[String]) -> Vec<Role> {
    raw.iter()
        .filter_map(|r| Role::from_str(r).ok())
        .collect()
}

fn role_strings(roles: &[Role]) -> Vec<String> {
    roles.iter().map(Role::to_string).collect()
}

#[async_trait]
impl PresenceStore for PostgresPresenceStore {
    async fn mark_online(
        &self,
        user: &OnlineUser,
        roles_to_persist: Option<&[Role]>,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        let insert_roles = role_strings(&user.roles);

        // Two statements instead of one parameterized branch: the conflict
        // arm must not touch `roles` unless the caller asked for it.
        if let Some(roles) = roles_to_persist {
            sqlx::query(
                "INSERT INTO presence_users
                     (uuid, name, account_type, roles, online, last_join, last_seen, ip)
                 VALUES ($1, $2, $3, $4, TRUE, $5, $5, $6)
                 ON CONFLICT (uuid) DO UPDATE SET
                     name = EXCLUDED.name,
                     account_type = EXCLUDED.account_type,
                     roles = EXCLUDED.roles,
                     online = TRUE,
                     last_seen = EXCLUDED.last_seen,
                     ip = EXCLUDED.ip",
            )
            .bind(&user.uuid)
            .bind(&user.name)
            .bind(user.account_type.to_string())
            .bind(role_strings(roles))
            .bind(now)
            .bind(&user.ip)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "INSERT INTO presence_users
                     (uuid, name, account_type, roles, online, last_join, last_seen, ip)
                 VALUES ($1, $2, $3, $4, TRUE, $5, $5, $6)
                 ON CONFLICT (uuid) DO UPDATE SET
                     name = EXCLUDED.name,
                     account_type = EXCLUDED.account_type,
                     online = TRUE,
                     last_seen = EXCLUDED.last_seen,
                     ip = EXCLUDED.ip",
            )
            .bind(&user.uuid)
            .bind(&user.name)
            .bind(user.account_type.to_string())
            .bind(insert_roles)
            .bind(now)
            .bind(&user.ip)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn mark_offline(&self, uuid: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO presence_users (uuid, name, account_type, roles, online, last_leave)
             VALUES ($1, 'Unknown', 'LOCAL', '{MEMBER}', FALSE, $2)
             ON CONFLICT (uuid) DO UPDATE SET
                 online = FALSE,
                 last_leave = EXCLUDED.last_leave",
        )
        .bind(uuid)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_last_seen(&self, uuid: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE presence_users SET last_seen = $2, online = TRUE WHERE uuid = $1")
            .bind(uuid)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_roles(&self, uuid: &str, roles: &[Role]) -> Result<(), StoreError> {
        sqlx::query("UPDATE presence_users SET roles = $2 WHERE uuid = $1")
            .bind(uuid)
            .bind(role_strings(roles))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_roles(&self, uuid: &str) -> Result<Option<Vec<Role>>, StoreError> {
        let raw: Option<Vec<String>> =
            sqlx::query_scalar("SELECT roles FROM presence_users WHERE uuid = $1")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;

        Ok(raw.map(|r| parse_roles(&r)).filter(|r| !r.is_empty()))
    }

    async fn fetch_online_users(&self, limit: usize) -> Result<Vec<PresenceRecord>, StoreError> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT uuid, name, account_type, roles, online, last_join, last_seen, last_leave
             FROM presence_users
             WHERE online = TRUE
             ORDER BY last_seen DESC NULLS LAST
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PresenceRecord::from).collect())
    }

    async fn count_online_users(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM presence_users WHERE online = TRUE")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn load_started_at(
        &self,
        env: &str,
        commit_hash: &str,
        now_ms: i64,
    ) -> Result<i64, StoreError> {
        let existing: Option<(i64, String)> = sqlx::query_as(
            "SELECT started_at_ms, commit_hash FROM gateway_health WHERE env = $1",
        )
        .bind(env)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((started_at, hash)) = existing {
            if hash == commit_hash {
                return Ok(started_at);
            }
        }

        // First writer for this commit hash wins; the WHERE clause keeps a
        // concurrent writer that already stamped the same hash untouched.
        let written: Option<i64> = sqlx::query_scalar(
            "INSERT INTO gateway_health (env, started_at_ms, commit_hash)
             VALUES ($1, $2, $3)
             ON CONFLICT (env) DO UPDATE SET
                 started_at_ms = EXCLUDED.started_at_ms,
                 commit_hash = EXCLUDED.commit_hash
             WHERE gateway_health.commit_hash <> EXCLUDED.commit_hash
             RETURNING started_at_ms",
        )
        .bind(env)
        .bind(now_ms)
        .bind(commit_hash)
        .fetch_optional(&self.pool)
        .await?;

        match written {
            Some(started_at) => Ok(started_at),
            None => {
                let started_at: i64 = sqlx::query_scalar(
                    "SELECT started_at_ms FROM gateway_health WHERE env = $1",
                )
                .bind(env)
                .fetch_one(&self.pool)
                .await?;
                Ok(started_at)
            }
        }
    }

    async fn put_warp_status(&self, key: &str, payload: &Value) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO warp_status (key, payload, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE SET
                 payload = EXCLUDED.payload,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(key)
        .bind(payload)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
