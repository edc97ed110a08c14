// Workspace membership lookups used by the upgrade gate.

use anyhow::Context;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

use crate::db::pool::{check_pool_health, create_pg_pool, PoolConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceRole {
    Owner,
    Editor,
    Commenter,
    Viewer,
}

impl WorkspaceRole {
    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Self::Owner),
            "editor" => Some(Self::Editor),
            "commenter" => Some(Self::Commenter),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Editor => "editor",
            Self::Commenter => "commenter",
            Self::Viewer => "viewer",
        }
    }
}

#[derive(Clone)]
pub enum WorkspaceMembershipStore {
    Postgres(sqlx::PgPool),
    Memory(Arc<RwLock<HashMap<(String, String), WorkspaceRole>>>),
}

impl WorkspaceMembershipStore {
    pub async fn connect(database_url: &str, config: PoolConfig) -> anyhow::Result<Self> {
        let pool = create_pg_pool(database_url, config)
            .await
            .context("failed to initialize hub PostgreSQL pool for membership lookups")?;
        check_pool_health(&pool)
            .await
            .context("hub PostgreSQL health check failed for membership lookups")?;

        Ok(Self::Postgres(pool))
    }

    pub fn pool(&self) -> Option<&sqlx::PgPool> {
        match self {
            Self::Postgres(pool) => Some(pool),
            Self::Memory(_) => None,
        }
    }

    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Grant a role in the in-memory store. No-op for the Postgres store.
    pub async fn grant(&self, workspace_id: &str, user_id: &str, role: WorkspaceRole) {
        if let Self::Memory(store) = self {
            store.write().await.insert((workspace_id.to_string(), user_id.to_string()), role);
        }
    }

    pub async fn role_for_user(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<WorkspaceRole>> {
        match self {
            Self::Postgres(pool) => {
                let role = sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT wm.role
                    FROM workspace_members AS wm
                    INNER JOIN workspaces AS w
                        ON w.id = wm.workspace_id
                    WHERE wm.workspace_id::text = $1
                      AND wm.user_id::text = $2
                      AND wm.status = 'active'
                      AND w.deleted_at IS NULL
                    "#,
                )
                .bind(workspace_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to query workspace role for websocket upgrade")?
                .map(|role| {
                    WorkspaceRole::from_db_value(&role).ok_or_else(|| {
                        anyhow::anyhow!("invalid workspace role '{role}' in database")
                    })
                })
                .transpose()?;

                Ok(role)
            }
            Self::Memory(store) => Ok(store
                .read()
                .await
                .get(&(workspace_id.to_string(), user_id.to_string()))
                .copied()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkspaceMembershipStore, WorkspaceRole};

    #[test]
    fn role_round_trips_through_db_values() {
        for role in [
            WorkspaceRole::Owner,
            WorkspaceRole::Editor,
            WorkspaceRole::Commenter,
            WorkspaceRole::Viewer,
        ] {
            assert_eq!(WorkspaceRole::from_db_value(role.as_str()), Some(role));
        }
        assert_eq!(WorkspaceRole::from_db_value("superuser"), None);
    }

    #[tokio::test]
    async fn memory_store_scopes_roles_per_workspace() {
        let store = WorkspaceMembershipStore::in_memory();
        store.grant("w1", "ann", WorkspaceRole::Editor).await;

        assert_eq!(
            store.role_for_user("w1", "ann").await.expect("lookup"),
            Some(WorkspaceRole::Editor)
        );
        assert_eq!(store.role_for_user("w2", "ann").await.expect("lookup"), None);
        assert_eq!(store.role_for_user("w1", "bob").await.expect("lookup"), None);
    }
}
