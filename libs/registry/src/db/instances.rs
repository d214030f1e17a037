use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{is_unique_violation, next_revision, PgRegistry};
use crate::error::{RegistryError, RegistryResult};
use crate::store::{ControllerInstanceStore, InstanceWatch};
use crate::types::{ControllerInstance, InstanceList, WatchEvent, WatchEventType};

const KIND: &str = "ControllerInstance";
const WATCH_BATCH: i64 = 100;
const WATCH_BUFFER: usize = 256;
/// Prune the event log once every this many revisions.
const COMPACTION_STRIDE: i64 = 256;

struct InstanceRow(ControllerInstance);

fn lease_millis(instance: &ControllerInstance) -> i64 {
    i64::try_from(instance.lease_duration_ms).unwrap_or(i64::MAX)
}

impl<'r> sqlx::FromRow<'r, PgRow> for InstanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let resource_version: i64 = row.try_get("resource_version")?;
        let lease_duration_ms: i64 = row.try_get("lease_duration_ms")?;
        Ok(Self(ControllerInstance {
            name: row.try_get("name")?,
            controller_type: row.try_get("controller_type")?,
            controller_key: row.try_get("controller_key")?,
            workload_num: row.try_get("workload_num")?,
            is_locked: row.try_get("is_locked")?,
            lease_duration_ms: lease_duration_ms.max(0) as u64,
            resource_version: resource_version as u64,
            deletion_timestamp: None,
        }))
    }
}

/// A row from the registry_events table.
struct EventRow {
    event_id: i64,
    event_type: String,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl EventRow {
    fn decode(self) -> RegistryResult<WatchEvent<ControllerInstance>> {
        let event_type = self.event_type.parse::<WatchEventType>().map_err(|e| {
            RegistryError::Unavailable(format!("event {}: {e}", self.event_id))
        })?;
        let object: ControllerInstance = serde_json::from_value(self.payload)?;
        Ok(WatchEvent::new(event_type, object))
    }
}

impl PgRegistry {
    async fn append_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WatchEvent<ControllerInstance>,
    ) -> RegistryResult<()> {
        let event_id = event.object.resource_version as i64;
        sqlx::query(
            r#"
            INSERT INTO registry_events (event_id, object_name, controller_type, event_type, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event_id)
        .bind(&event.object.name)
        .bind(&event.object.controller_type)
        .bind(event.event_type.as_str())
        .bind(serde_json::to_value(&event.object)?)
        .execute(&mut **tx)
        .await?;

        if event_id % COMPACTION_STRIDE == 0 {
            self.compact(tx, event_id - self.retained_events).await?;
        }
        Ok(())
    }

    async fn compact(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        through: i64,
    ) -> RegistryResult<()> {
        if through <= 0 {
            return Ok(());
        }
        let pruned = sqlx::query("DELETE FROM registry_events WHERE event_id <= $1")
            .bind(through)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        sqlx::query(
            "UPDATE registry_compaction SET compacted_through = GREATEST(compacted_through, $1) WHERE id = 1",
        )
        .bind(through)
        .execute(&mut **tx)
        .await?;
        debug!(through, pruned, "Compacted registry event log");
        Ok(())
    }

    async fn compacted_through(&self) -> RegistryResult<i64> {
        let through: i64 =
            sqlx::query_scalar("SELECT compacted_through FROM registry_compaction WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?
                .unwrap_or(0);
        Ok(through)
    }

    async fn query_events_after(
        &self,
        controller_type: Option<&str>,
        after_event_id: i64,
    ) -> RegistryResult<Vec<EventRow>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, event_type, payload
            FROM registry_events
            WHERE event_id > $1
              AND ($2::TEXT IS NULL OR controller_type = $2)
            ORDER BY event_id ASC
            LIMIT $3
            "#,
        )
        .bind(after_event_id)
        .bind(controller_type)
        .bind(WATCH_BATCH)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Tail the event log after `cursor`, forwarding decoded events.
    async fn tail_events(
        self,
        controller_type: Option<String>,
        mut cursor: i64,
        tx: mpsc::Sender<RegistryResult<WatchEvent<ControllerInstance>>>,
    ) {
        loop {
            let compacted = match self.compacted_through().await {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if cursor < compacted {
                warn!(cursor, compacted, "Watch cursor fell behind compaction");
                let _ = tx
                    .send(Err(RegistryError::Expired {
                        requested: cursor as u64,
                        oldest: compacted as u64,
                    }))
                    .await;
                return;
            }

            let rows = match self.query_events_after(controller_type.as_deref(), cursor).await {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            if rows.is_empty() {
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(self.watch_poll_interval) => {}
                }
                continue;
            }

            for row in rows {
                cursor = row.event_id;
                if tx.send(row.decode()).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl ControllerInstanceStore for PgRegistry {
    async fn list_instances(&self, controller_type: Option<&str>) -> RegistryResult<InstanceList> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let revision: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(event_id), 0) FROM registry_events")
                .fetch_one(&mut *tx)
                .await?;
        let revision = revision.max(self.compacted_through().await?);

        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT name, controller_type, controller_key, workload_num, is_locked,
                   lease_duration_ms, resource_version
            FROM controller_instances
            WHERE ($1::TEXT IS NULL OR controller_type = $1)
            ORDER BY controller_key ASC, name ASC
            "#,
        )
        .bind(controller_type)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(InstanceList {
            items: rows.into_iter().map(|r| r.0).collect(),
            resource_version: revision as u64,
        })
    }

    async fn get_instance(&self, name: &str) -> RegistryResult<ControllerInstance> {
        sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT name, controller_type, controller_key, workload_num, is_locked,
                   lease_duration_ms, resource_version
            FROM controller_instances
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .map(|r| r.0)
        .ok_or_else(|| RegistryError::NotFound {
            kind: KIND,
            name: name.to_string(),
        })
    }

    async fn create_instance(
        &self,
        mut instance: ControllerInstance,
    ) -> RegistryResult<ControllerInstance> {
        let mut tx = self.begin_write().await?;
        let revision = next_revision(&mut tx).await?;
        instance.resource_version = revision as u64;
        instance.deletion_timestamp = None;

        sqlx::query(
            r#"
            INSERT INTO controller_instances
                (name, controller_type, controller_key, workload_num, is_locked,
                 resource_version, lease_duration_ms, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7,
                    CASE WHEN $7 > 0 THEN now() + ($7 * INTERVAL '1 millisecond') END)
            "#,
        )
        .bind(&instance.name)
        .bind(&instance.controller_type)
        .bind(instance.controller_key)
        .bind(instance.workload_num)
        .bind(instance.is_locked)
        .bind(revision)
        .bind(lease_millis(&instance))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RegistryError::AlreadyExists {
                    kind: KIND,
                    name: instance.name.clone(),
                }
            } else {
                RegistryError::Database(e)
            }
        })?;

        let event = WatchEvent::new(WatchEventType::Added, instance);
        self.append_event(&mut tx, &event).await?;
        tx.commit().await?;

        info!(name = %event.object.name, controller_type = %event.object.controller_type, resource_version = revision, "Created controller instance");
        Ok(event.object)
    }

    async fn update_instance(
        &self,
        mut instance: ControllerInstance,
    ) -> RegistryResult<ControllerInstance> {
        let mut tx = self.begin_write().await?;

        let stored = sqlx::query(
            "SELECT controller_type, resource_version FROM controller_instances WHERE name = $1 FOR UPDATE",
        )
        .bind(&instance.name)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(stored) = stored else {
            return Err(RegistryError::NotFound {
                kind: KIND,
                name: instance.name,
            });
        };
        let stored_type: String = stored.try_get("controller_type")?;
        let stored_rv: i64 = stored.try_get("resource_version")?;

        if stored_type != instance.controller_type {
            return Err(RegistryError::ImmutableField {
                kind: KIND,
                name: instance.name,
                field: "controller_type",
            });
        }
        if stored_rv as u64 != instance.resource_version {
            return Err(RegistryError::Conflict {
                kind: KIND,
                name: instance.name,
                expected: instance.resource_version,
                actual: stored_rv as u64,
            });
        }

        let revision = next_revision(&mut tx).await?;
        instance.resource_version = revision as u64;
        sqlx::query(
            r#"
            UPDATE controller_instances
            SET controller_key = $2,
                workload_num = $3,
                is_locked = $4,
                resource_version = $5,
                lease_duration_ms = $6,
                expires_at = CASE WHEN $6 > 0 THEN now() + ($6 * INTERVAL '1 millisecond') END,
                updated_at = now()
            WHERE name = $1
            "#,
        )
        .bind(&instance.name)
        .bind(instance.controller_key)
        .bind(instance.workload_num)
        .bind(instance.is_locked)
        .bind(revision)
        .bind(lease_millis(&instance))
        .execute(&mut *tx)
        .await?;

        let event = WatchEvent::new(WatchEventType::Modified, instance);
        self.append_event(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(event.object)
    }

    async fn delete_instance(&self, name: &str) -> RegistryResult<()> {
        let mut tx = self.begin_write().await?;

        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            DELETE FROM controller_instances
            WHERE name = $1
            RETURNING name, controller_type, controller_key, workload_num, is_locked,
                      lease_duration_ms, resource_version
            "#,
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(InstanceRow(mut instance)) = row else {
            return Err(RegistryError::NotFound {
                kind: KIND,
                name: name.to_string(),
            });
        };

        let revision = next_revision(&mut tx).await?;
        instance.resource_version = revision as u64;
        instance.deletion_timestamp = Some(Utc::now());

        let event = WatchEvent::new(WatchEventType::Deleted, instance);
        self.append_event(&mut tx, &event).await?;
        tx.commit().await?;

        info!(name, resource_version = revision, "Deleted controller instance");
        Ok(())
    }

    async fn renew_instance(&self, name: &str) -> RegistryResult<()> {
        let renewed = sqlx::query(
            r#"
            UPDATE controller_instances
            SET expires_at = CASE
                WHEN lease_duration_ms > 0 THEN now() + (lease_duration_ms * INTERVAL '1 millisecond')
            END
            WHERE name = $1
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if renewed == 0 {
            return Err(RegistryError::NotFound {
                kind: KIND,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn reap_expired_instances(
        &self,
        controller_type: Option<&str>,
    ) -> RegistryResult<Vec<String>> {
        let mut tx = self.begin_write().await?;

        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            DELETE FROM controller_instances
            WHERE expires_at IS NOT NULL
              AND expires_at <= now()
              AND ($1::TEXT IS NULL OR controller_type = $1)
            RETURNING name, controller_type, controller_key, workload_num, is_locked,
                      lease_duration_ms, resource_version
            "#,
        )
        .bind(controller_type)
        .fetch_all(&mut *tx)
        .await?;

        let mut expired: Vec<ControllerInstance> = rows.into_iter().map(|r| r.0).collect();
        expired.sort_by(|a, b| a.name.cmp(&b.name));

        let mut reaped = Vec::with_capacity(expired.len());
        for mut instance in expired {
            let revision = next_revision(&mut tx).await?;
            instance.resource_version = revision as u64;
            instance.deletion_timestamp = Some(Utc::now());
            reaped.push(instance.name.clone());
            self.append_event(&mut tx, &WatchEvent::new(WatchEventType::Deleted, instance))
                .await?;
        }
        tx.commit().await?;

        for name in &reaped {
            warn!(name = %name, "Reaped expired controller instance");
        }
        Ok(reaped)
    }

    async fn watch_instances(
        &self,
        controller_type: Option<&str>,
        since: u64,
    ) -> RegistryResult<InstanceWatch> {
        let compacted = self.compacted_through().await?;
        if (since as i64) < compacted {
            return Err(RegistryError::Expired {
                requested: since,
                oldest: compacted as u64,
            });
        }

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let tailer = self.clone();
        tokio::spawn(tailer.tail_events(controller_type.map(str::to_string), since as i64, tx));
        Ok(ReceiverStream::new(rx).boxed())
    }
}
