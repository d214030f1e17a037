use async_trait::async_trait;
use scf_endpoints::{EndpointSubset, Endpoints};
use sqlx::Row;

use super::{is_unique_violation, next_revision, PgRegistry};
use crate::error::{RegistryError, RegistryResult};
use crate::store::EndpointsStore;

const KIND: &str = "Endpoints";

fn object_name(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[async_trait]
impl EndpointsStore for PgRegistry {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> RegistryResult<Endpoints> {
        let row = sqlx::query(
            "SELECT subsets, resource_version FROM endpoints WHERE namespace = $1 AND name = $2",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(RegistryError::NotFound {
                kind: KIND,
                name: object_name(namespace, name),
            });
        };
        let subsets: serde_json::Value = row.try_get("subsets")?;
        let resource_version: i64 = row.try_get("resource_version")?;

        Ok(Endpoints {
            namespace: namespace.to_string(),
            name: name.to_string(),
            subsets: serde_json::from_value::<Vec<EndpointSubset>>(subsets)?,
            resource_version: resource_version as u64,
        })
    }

    async fn create_endpoints(&self, mut endpoints: Endpoints) -> RegistryResult<Endpoints> {
        let mut tx = self.begin_write().await?;
        let revision = next_revision(&mut tx).await?;

        sqlx::query(
            r#"
            INSERT INTO endpoints (namespace, name, subsets, resource_version)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&endpoints.namespace)
        .bind(&endpoints.name)
        .bind(serde_json::to_value(&endpoints.subsets)?)
        .bind(revision)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RegistryError::AlreadyExists {
                    kind: KIND,
                    name: object_name(&endpoints.namespace, &endpoints.name),
                }
            } else {
                RegistryError::Database(e)
            }
        })?;
        tx.commit().await?;

        endpoints.resource_version = revision as u64;
        Ok(endpoints)
    }

    async fn update_endpoints(&self, mut endpoints: Endpoints) -> RegistryResult<Endpoints> {
        let mut tx = self.begin_write().await?;
        let revision = next_revision(&mut tx).await?;

        let updated = sqlx::query(
            r#"
            UPDATE endpoints
            SET subsets = $3, resource_version = $4, updated_at = now()
            WHERE namespace = $1 AND name = $2 AND resource_version = $5
            "#,
        )
        .bind(&endpoints.namespace)
        .bind(&endpoints.name)
        .bind(serde_json::to_value(&endpoints.subsets)?)
        .bind(revision)
        .bind(endpoints.resource_version as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let stored: Option<i64> = sqlx::query_scalar(
                "SELECT resource_version FROM endpoints WHERE namespace = $1 AND name = $2",
            )
            .bind(&endpoints.namespace)
            .bind(&endpoints.name)
            .fetch_optional(&mut *tx)
            .await?;

            let name = object_name(&endpoints.namespace, &endpoints.name);
            return Err(match stored {
                Some(actual) => RegistryError::Conflict {
                    kind: KIND,
                    name,
                    expected: endpoints.resource_version,
                    actual: actual as u64,
                },
                None => RegistryError::NotFound { kind: KIND, name },
            });
        }
        tx.commit().await?;

        endpoints.resource_version = revision as u64;
        Ok(endpoints)
    }
}
