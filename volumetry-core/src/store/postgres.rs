//! Postgres backend.
//!
//! Uses the runtime query API so the workspace builds without a prepared
//! database; the schema lives in the embedded migrations.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use async_trait::async_trait;
use volumetry_model::{
    AccessMode, Container, Mount, Page, ScanRun, ScanStatus, SizeSample, SortField, TrendPoint,
    Volume, VolumeAttachment, VolumeError, VolumeFilters, VolumeResult, VolumeSort, VolumeSummary,
};

use super::VolumeStore;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    system_regex: Option<Regex>,
}

fn storage_err(err: sqlx::Error) -> VolumeError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            VolumeError::PersistenceUnavailable(err.to_string())
        }
        _ => VolumeError::Storage(err.to_string()),
    }
}

fn labels_to_json(labels: &HashMap<String, String>) -> serde_json::Value {
    serde_json::to_value(labels).unwrap_or_else(|_| serde_json::json!({}))
}

fn json_to_labels(value: serde_json::Value) -> HashMap<String, String> {
    serde_json::from_value(value).unwrap_or_default()
}

fn row_to_volume(row: &PgRow) -> Result<Volume, sqlx::Error> {
    Ok(Volume {
        name: row.try_get("name")?,
        driver: row.try_get("driver")?,
        mountpoint: row.try_get("mountpoint")?,
        labels: json_to_labels(row.try_get("labels")?),
        options: json_to_labels(row.try_get("options")?),
        scope: row.try_get("scope")?,
        status: row.try_get("status")?,
        is_active: row.try_get("is_active")?,
        last_scanned_at: row.try_get("last_scanned_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_container(row: &PgRow) -> Result<Container, sqlx::Error> {
    Ok(Container {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
        state: row.try_get("state")?,
        status: row.try_get("status")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        is_active: row.try_get("is_active")?,
    })
}

fn row_to_mount(row: &PgRow) -> Result<Mount, sqlx::Error> {
    let access_mode: String = row.try_get("access_mode")?;
    Ok(Mount {
        volume_name: row.try_get("volume_name")?,
        container_id: row.try_get("container_id")?,
        mount_path: row.try_get("mount_path")?,
        access_mode: AccessMode::parse(&access_mode),
        is_active: row.try_get("is_active")?,
    })
}

fn row_to_scan_run(row: &PgRow) -> Result<ScanRun, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let progress: i16 = row.try_get("progress")?;
    Ok(ScanRun {
        scan_id: row.try_get("scan_id")?,
        volume_name: row.try_get("volume_name")?,
        method: row.try_get("method")?,
        status: ScanStatus::parse(&status).unwrap_or(ScanStatus::Failed),
        progress: progress.clamp(0, 100) as u8,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
        result_ref: row.try_get("result_ref")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_sample(row: &PgRow) -> Result<SizeSample, sqlx::Error> {
    Ok(SizeSample {
        id: row.try_get("id")?,
        volume_name: row.try_get("volume_name")?,
        ts: row.try_get("ts")?,
        size_bytes: row.try_get("size_bytes")?,
        file_count: row.try_get("file_count")?,
        dir_count: row.try_get("dir_count")?,
        largest_file: row.try_get("largest_file")?,
        method: row.try_get("method")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

impl PgStore {
    pub async fn connect(
        dsn: &str,
        max_conns: u32,
        timeout: Duration,
        system_regex: Option<Regex>,
    ) -> VolumeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_conns.max(1))
            .acquire_timeout(timeout)
            .connect(dsn)
            .await
            .map_err(|err| VolumeError::PersistenceUnavailable(err.to_string()))?;

        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .map_err(|err| VolumeError::PersistenceUnavailable(err.to_string()))?;

        Ok(Self { pool, system_regex })
    }

    /// Shared trunk of the listing query: inner projection plus outer
    /// predicates for the derived columns.
    fn push_listing_core<'q>(
        &self,
        builder: &mut QueryBuilder<'q, Postgres>,
        filters: &'q VolumeFilters,
    ) {
        builder.push(
            " FROM (SELECT v.name, v.driver, v.mountpoint, v.labels, v.created_at, \
             v.last_scanned_at, v.name ~ '^[0-9a-f]{64}$' AS is_anonymous, \
             coalesce((SELECT count(*) FROM mounts m \
                       WHERE m.volume_name = v.name AND m.is_active), 0) AS attachments_count, \
             (SELECT s.size_bytes FROM size_samples s \
              WHERE s.volume_name = v.name ORDER BY s.ts DESC LIMIT 1) AS size_bytes \
             FROM volumes v WHERE v.is_active = TRUE",
        );
        if let Some(driver) = &filters.driver {
            builder.push(" AND v.driver = ").push_bind(driver);
        }
        if let Some(query) = &filters.query {
            builder
                .push(" AND v.name ILIKE ")
                .push_bind(format!("%{query}%"));
        }
        if let Some(after) = filters.created_after {
            builder.push(" AND v.created_at >= ").push_bind(after);
        }
        if let Some(before) = filters.created_before {
            builder.push(" AND v.created_at <= ").push_bind(before);
        }
        builder.push(") q WHERE TRUE");

        if let Some(want_orphaned) = filters.orphaned {
            if want_orphaned {
                builder.push(" AND q.attachments_count = 0");
            } else {
                builder.push(" AND q.attachments_count > 0");
            }
        }
        if let Some(want_system) = filters.system {
            let prefix = if want_system { " AND (" } else { " AND NOT (" };
            builder.push(prefix).push("q.is_anonymous");
            if let Some(pattern) = self.system_regex.as_ref().map(|r| r.as_str().to_string()) {
                builder.push(" OR q.name ~ ").push_bind(pattern);
            }
            builder.push(")");
        }
    }

    fn order_clause(sort: VolumeSort) -> String {
        let direction = if sort.descending { "DESC" } else { "ASC" };
        match sort.field {
            SortField::Name => format!("ORDER BY q.name {direction}"),
            SortField::Driver => format!("ORDER BY q.driver {direction}, q.name ASC"),
            SortField::CreatedAt => format!("ORDER BY q.created_at {direction}, q.name ASC"),
            SortField::SizeBytes => {
                format!("ORDER BY q.size_bytes {direction} NULLS LAST, q.name ASC")
            }
        }
    }
}

#[async_trait]
impl VolumeStore for PgStore {
    async fn ping(&self) -> VolumeResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| VolumeError::PersistenceUnavailable(err.to_string()))
    }

    async fn upsert_volume(&self, volume: &Volume) -> VolumeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO volumes (
                name, driver, mountpoint, labels, options, scope, status,
                is_active, last_scanned_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
            ON CONFLICT (name) DO UPDATE SET
                driver = EXCLUDED.driver,
                mountpoint = EXCLUDED.mountpoint,
                labels = EXCLUDED.labels,
                options = EXCLUDED.options,
                scope = EXCLUDED.scope,
                status = EXCLUDED.status,
                is_active = EXCLUDED.is_active,
                last_scanned_at = coalesce(volumes.last_scanned_at, EXCLUDED.last_scanned_at),
                updated_at = now()
            "#,
        )
        .bind(&volume.name)
        .bind(&volume.driver)
        .bind(&volume.mountpoint)
        .bind(labels_to_json(&volume.labels))
        .bind(labels_to_json(&volume.options))
        .bind(&volume.scope)
        .bind(&volume.status)
        .bind(volume.is_active)
        .bind(volume.last_scanned_at)
        .bind(volume.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn deactivate_volume(&self, name: &str) -> VolumeResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        sqlx::query("UPDATE volumes SET is_active = FALSE, updated_at = now() WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        sqlx::query("UPDATE mounts SET is_active = FALSE WHERE volume_name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)
    }

    async fn get_volume_by_name(&self, name: &str) -> VolumeResult<Option<Volume>> {
        let row = sqlx::query("SELECT * FROM volumes WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref()
            .map(row_to_volume)
            .transpose()
            .map_err(storage_err)
    }

    async fn list_volumes(
        &self,
        filters: &VolumeFilters,
        sort: VolumeSort,
        page: Page,
    ) -> VolumeResult<(Vec<VolumeSummary>, i64)> {
        let mut count_builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT count(*) AS total");
        self.push_listing_core(&mut count_builder, filters);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .try_get("total")
            .map_err(storage_err)?;

        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT q.name, q.driver, q.mountpoint, q.labels, q.created_at, \
             q.last_scanned_at, q.attachments_count, q.size_bytes",
        );
        self.push_listing_core(&mut builder, filters);
        builder.push(" ");
        builder.push(Self::order_clause(sort));
        builder.push(" LIMIT ").push_bind(page.limit);
        builder.push(" OFFSET ").push_bind(page.offset);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name").map_err(storage_err)?;
            let attachments_count: i64 = row.try_get("attachments_count").map_err(storage_err)?;
            let is_system = volumetry_model::volume::is_anonymous_name(&name)
                || self
                    .system_regex
                    .as_ref()
                    .is_some_and(|re| re.is_match(&name));
            summaries.push(VolumeSummary {
                driver: row.try_get("driver").map_err(storage_err)?,
                created_at: row.try_get("created_at").map_err(storage_err)?,
                mountpoint: row.try_get("mountpoint").map_err(storage_err)?,
                labels: json_to_labels(row.try_get("labels").map_err(storage_err)?),
                size_bytes: row.try_get("size_bytes").map_err(storage_err)?,
                attachments_count,
                is_system,
                is_orphaned: attachments_count == 0,
                last_scanned_at: row.try_get("last_scanned_at").map_err(storage_err)?,
                name,
            });
        }
        Ok((summaries, total))
    }

    async fn list_active_volumes(&self) -> VolumeResult<Vec<Volume>> {
        let rows = sqlx::query("SELECT * FROM volumes WHERE is_active = TRUE ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(row_to_volume)
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)
    }

    async fn upsert_container(&self, container: &Container) -> VolumeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO containers (id, name, image, state, status, started_at, finished_at, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                image = EXCLUDED.image,
                state = EXCLUDED.state,
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                is_active = EXCLUDED.is_active
            "#,
        )
        .bind(&container.id)
        .bind(&container.name)
        .bind(&container.image)
        .bind(&container.state)
        .bind(&container.status)
        .bind(container.started_at)
        .bind(container.finished_at)
        .bind(container.is_active)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn deactivate_container(&self, id: &str) -> VolumeResult<()> {
        sqlx::query("UPDATE containers SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_container(&self, id: &str) -> VolumeResult<Option<Container>> {
        let row = sqlx::query("SELECT * FROM containers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref()
            .map(row_to_container)
            .transpose()
            .map_err(storage_err)
    }

    async fn list_active_containers(&self) -> VolumeResult<Vec<Container>> {
        let rows = sqlx::query("SELECT * FROM containers WHERE is_active = TRUE ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(row_to_container)
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)
    }

    async fn upsert_mount(&self, mount: &Mount) -> VolumeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO mounts (volume_name, container_id, mount_path, access_mode, is_active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (volume_name, container_id, mount_path) DO UPDATE SET
                access_mode = EXCLUDED.access_mode,
                is_active = EXCLUDED.is_active
            "#,
        )
        .bind(&mount.volume_name)
        .bind(&mount.container_id)
        .bind(&mount.mount_path)
        .bind(mount.access_mode.as_str())
        .bind(mount.is_active)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn deactivate_mount(
        &self,
        volume_name: &str,
        container_id: &str,
        mount_path: &str,
    ) -> VolumeResult<()> {
        sqlx::query(
            "UPDATE mounts SET is_active = FALSE \
             WHERE volume_name = $1 AND container_id = $2 AND mount_path = $3",
        )
        .bind(volume_name)
        .bind(container_id)
        .bind(mount_path)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn deactivate_mounts_by_container(&self, container_id: &str) -> VolumeResult<()> {
        sqlx::query("UPDATE mounts SET is_active = FALSE WHERE container_id = $1")
            .bind(container_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn deactivate_mounts_by_volume(&self, volume_name: &str) -> VolumeResult<()> {
        sqlx::query("UPDATE mounts SET is_active = FALSE WHERE volume_name = $1")
            .bind(volume_name)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn list_active_mounts(&self) -> VolumeResult<Vec<Mount>> {
        let rows = sqlx::query("SELECT * FROM mounts WHERE is_active = TRUE")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(row_to_mount)
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)
    }

    async fn get_attachments(&self, volume_name: &str) -> VolumeResult<Vec<VolumeAttachment>> {
        let rows = sqlx::query(
            r#"
            SELECT m.container_id,
                   coalesce(c.name, m.container_id) AS container_name,
                   m.mount_path,
                   m.access_mode
            FROM mounts m
            LEFT JOIN containers c ON c.id = m.container_id
            WHERE m.volume_name = $1 AND m.is_active = TRUE
            ORDER BY m.container_id, m.mount_path
            "#,
        )
        .bind(volume_name)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                let access_mode: String = row.try_get("access_mode")?;
                Ok(VolumeAttachment {
                    container_id: row.try_get("container_id")?,
                    container_name: row.try_get("container_name")?,
                    mount_path: row.try_get("mount_path")?,
                    rw: AccessMode::parse(&access_mode) == AccessMode::Rw,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(storage_err)
    }

    async fn insert_scan_run(&self, run: &ScanRun) -> VolumeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_runs (
                scan_id, volume_name, method, status, progress,
                started_at, completed_at, error, result_ref, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(run.scan_id)
        .bind(&run.volume_name)
        .bind(&run.method)
        .bind(run.status.as_str())
        .bind(run.progress as i16)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error)
        .bind(run.result_ref)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn update_scan_run(&self, run: &ScanRun) -> VolumeResult<()> {
        // terminal rows are left untouched by the status guard
        sqlx::query(
            r#"
            UPDATE scan_runs SET
                status = $2, progress = $3, started_at = $4,
                completed_at = $5, error = $6, result_ref = $7
            WHERE scan_id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(run.scan_id)
        .bind(run.status.as_str())
        .bind(run.progress as i16)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error)
        .bind(run.result_ref)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_scan_run(&self, scan_id: Uuid) -> VolumeResult<Option<ScanRun>> {
        let row = sqlx::query("SELECT * FROM scan_runs WHERE scan_id = $1")
            .bind(scan_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref()
            .map(row_to_scan_run)
            .transpose()
            .map_err(storage_err)
    }

    async fn latest_scan_run(&self, volume_name: &str) -> VolumeResult<Option<ScanRun>> {
        let row = sqlx::query(
            "SELECT * FROM scan_runs WHERE volume_name = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(volume_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref()
            .map(row_to_scan_run)
            .transpose()
            .map_err(storage_err)
    }

    async fn list_active_scan_runs(&self) -> VolumeResult<Vec<ScanRun>> {
        let rows = sqlx::query(
            "SELECT * FROM scan_runs WHERE status IN ('queued', 'running') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(row_to_scan_run)
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)
    }

    async fn cancel_stale_scan_runs(&self) -> VolumeResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_runs SET
                status = 'canceled',
                completed_at = now(),
                error = 'interrupted by restart'
            WHERE status IN ('queued', 'running')
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn insert_size_sample(&self, sample: &SizeSample) -> VolumeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO size_samples (
                id, volume_name, ts, size_bytes, file_count,
                dir_count, largest_file, method, duration_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(sample.id)
        .bind(&sample.volume_name)
        .bind(sample.ts)
        .bind(sample.size_bytes)
        .bind(sample.file_count)
        .bind(sample.dir_count)
        .bind(sample.largest_file)
        .bind(&sample.method)
        .bind(sample.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn latest_size_sample(&self, volume_name: &str) -> VolumeResult<Option<SizeSample>> {
        let row = sqlx::query(
            "SELECT * FROM size_samples WHERE volume_name = $1 ORDER BY ts DESC LIMIT 1",
        )
        .bind(volume_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref()
            .map(row_to_sample)
            .transpose()
            .map_err(storage_err)
    }

    async fn get_size_samples(
        &self,
        volume_name: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> VolumeResult<Vec<SizeSample>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM size_samples
            WHERE volume_name = $1 AND ($2::timestamptz IS NULL OR ts >= $2)
            ORDER BY ts DESC
            LIMIT $3
            "#,
        )
        .bind(volume_name)
        .bind(since)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(row_to_sample)
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)
    }

    async fn aggregate_trend(
        &self,
        volumes: &[String],
        days: i64,
    ) -> VolumeResult<Vec<TrendPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT date_trunc('day', ts)::date AS day,
                   sum(size_bytes)::bigint AS total_bytes,
                   count(*)::bigint AS sample_count
            FROM size_samples
            WHERE ts >= now() - make_interval(days => $1::int)
              AND (cardinality($2::text[]) = 0 OR volume_name = ANY($2))
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(days.max(1) as i32)
        .bind(volumes)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                Ok(TrendPoint {
                    date: row.try_get("day")?,
                    total_bytes: row.try_get("total_bytes")?,
                    sample_count: row.try_get("sample_count")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(storage_err)
    }

    async fn finalize_scan_success(
        &self,
        run: &ScanRun,
        sample: &SizeSample,
    ) -> VolumeResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            r#"
            INSERT INTO size_samples (
                id, volume_name, ts, size_bytes, file_count,
                dir_count, largest_file, method, duration_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(sample.id)
        .bind(&sample.volume_name)
        .bind(sample.ts)
        .bind(sample.size_bytes)
        .bind(sample.file_count)
        .bind(sample.dir_count)
        .bind(sample.largest_file)
        .bind(&sample.method)
        .bind(sample.duration_ms)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            UPDATE scan_runs SET
                status = $2, progress = 100, completed_at = $3, result_ref = $4
            WHERE scan_id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(run.scan_id)
        .bind(run.status.as_str())
        .bind(run.completed_at)
        .bind(run.result_ref)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "UPDATE volumes SET last_scanned_at = $2, updated_at = now() WHERE name = $1",
        )
        .bind(&run.volume_name)
        .bind(run.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)
    }
}
