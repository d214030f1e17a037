use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;

use super::PgRegistry;
use crate::error::RegistryResult;
use crate::store::LeaseStore;
use crate::types::Lease;

#[async_trait]
impl LeaseStore for PgRegistry {
    async fn renew_lease(
        &self,
        service_group_id: &str,
        ip: &str,
        ttl: Duration,
    ) -> RegistryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO apiserver_leases (service_group_id, ip, expires_at)
            VALUES ($1, $2, now() + ($3 * INTERVAL '1 millisecond'))
            ON CONFLICT (service_group_id, ip)
            DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(service_group_id)
        .bind(ip)
        .bind(ttl.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_leases(&self) -> RegistryResult<Vec<Lease>> {
        let rows = sqlx::query(
            r#"
            SELECT service_group_id, ip
            FROM apiserver_leases
            WHERE expires_at > now()
            ORDER BY service_group_id, ip
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Lease {
                    service_group_id: row.try_get("service_group_id")?,
                    ip: row.try_get("ip")?,
                })
            })
            .collect()
    }

    async fn remove_lease(&self, service_group_id: &str, ip: &str) -> RegistryResult<()> {
        sqlx::query("DELETE FROM apiserver_leases WHERE service_group_id = $1 AND ip = $2")
            .bind(service_group_id)
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
