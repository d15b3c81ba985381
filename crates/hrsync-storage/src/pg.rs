use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hrsync_core::{
    merge_batch, ApplicationGroup, AttachmentGroup, CandidateRecord, DerivedRow, EducationGroup,
    EmploymentGroup, MappingAuditRecord, MappingStatus, StageId, TransferAuditRecord,
    TransferStep,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

use crate::store::{
    CandidateStore, MappingStore, PageCommit, ProjectionRefresh, StageStatus, StoreError,
    TransferStore,
};

const CANDIDATE_COLUMNS: [&str; 17] = [
    "candidate_id",
    "first_name",
    "last_name",
    "full_name",
    "email",
    "phone_numbers",
    "addresses",
    "resume_links",
    "resume_filenames",
    "employment_titles",
    "employment_companies",
    "degrees",
    "jobs_name",
    "resume_content",
    "created_at",
    "updated_at",
    "raw",
];

const AUDIT_COLUMNS: &str =
    "candidate_id, status, resolved_reference, error_detail, attempted_at";

const TRANSFER_COLUMNS: &str =
    "candidate_id, status, source_ref, saved_path, file_size_bytes, error_detail, attempted_at";

/// Columns kept in step with the primary row on derived rows. The attachment
/// columns and `raw` carry the mapped file and are left alone.
fn refreshed_columns() -> impl Iterator<Item = &'static str> {
    CANDIDATE_COLUMNS.into_iter().filter(|c| {
        !matches!(
            *c,
            "candidate_id" | "resume_links" | "resume_filenames" | "raw"
        )
    })
}

fn transfer_table(step: TransferStep) -> &'static str {
    match step {
        TransferStep::ResumeDownload => "gh.resume_download_audit",
        TransferStep::AiAccessCopy => "gh.ai_access_copy_audit",
    }
}

fn source_table(stage: StageId) -> &'static str {
    match stage {
        StageId::SharePoint => "gh.candidates",
        StageId::AiAccess => "gh.sp_candidates",
        StageId::Metadata => "gh.ai_candidates",
    }
}

fn audit_table(stage: StageId) -> &'static str {
    match stage {
        StageId::SharePoint => "gh.sharepoint_mapping_audit",
        StageId::AiAccess => "gh.ai_access_mapping_audit",
        StageId::Metadata => "gh.metadata_mapping_audit",
    }
}

/// Link columns selected alongside the candidate columns of a stage's source.
fn link_columns(stage: StageId) -> &'static str {
    match stage {
        StageId::SharePoint => "NULL::text AS resolved_link, NULL::text AS metadata_link",
        StageId::AiAccess => "s.resolved_link, NULL::text AS metadata_link",
        StageId::Metadata => "s.resolved_link, s.metadata_link",
    }
}

/// Postgres-backed store over the `gh` schema.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn candidate_from_row(row: &PgRow) -> Result<CandidateRecord, StoreError> {
    let candidate_id: i64 = row.try_get("candidate_id")?;
    let attachments =
        AttachmentGroup::from_columns(row.try_get("resume_links")?, row.try_get("resume_filenames")?)
            .map_err(|err| StoreError::Corrupt {
                candidate_id,
                detail: err.to_string(),
            })?;

    Ok(CandidateRecord {
        candidate_id,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone_numbers")?,
        address: row.try_get("addresses")?,
        attachments,
        employment: EmploymentGroup {
            titles: row.try_get("employment_titles")?,
            companies: row.try_get("employment_companies")?,
        },
        education: EducationGroup {
            degrees: row.try_get("degrees")?,
        },
        applications: ApplicationGroup {
            job_names: row.try_get("jobs_name")?,
        },
        resume_content: row.try_get("resume_content")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        raw: row.try_get("raw")?,
    })
}

fn audit_from_row(row: &PgRow, stage: StageId) -> Result<MappingAuditRecord, StoreError> {
    let candidate_id: i64 = row.try_get("candidate_id")?;
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<MappingStatus>()
        .map_err(|err| StoreError::Corrupt {
            candidate_id,
            detail: err.to_string(),
        })?;
    Ok(MappingAuditRecord {
        candidate_id,
        stage,
        status,
        resolved_reference: row.try_get("resolved_reference")?,
        error_detail: row.try_get("error_detail")?,
        attempted_at: row.try_get("attempted_at")?,
    })
}

fn transfer_from_row(row: &PgRow, step: TransferStep) -> Result<TransferAuditRecord, StoreError> {
    let candidate_id: i64 = row.try_get("candidate_id")?;
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<MappingStatus>()
        .map_err(|err| StoreError::Corrupt {
            candidate_id,
            detail: err.to_string(),
        })?;
    Ok(TransferAuditRecord {
        candidate_id,
        step,
        status,
        source_ref: row.try_get("source_ref")?,
        saved_path: row.try_get("saved_path")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        error_detail: row.try_get("error_detail")?,
        attempted_at: row.try_get("attempted_at")?,
    })
}

/// `UPDATE {table} d SET col = c.col, ...` from the primary row, touching only
/// rows whose refreshed columns differ.
fn refresh_sql(table: &str) -> String {
    let columns: Vec<&str> = refreshed_columns().collect();
    let assignments = columns
        .iter()
        .map(|c| format!("{c} = c.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let derived = columns
        .iter()
        .map(|c| format!("d.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let primary = columns
        .iter()
        .map(|c| format!("c.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {table} d SET {assignments} FROM gh.candidates c \
         WHERE d.candidate_id = c.candidate_id AND ({derived}) IS DISTINCT FROM ({primary})"
    )
}

/// `INSERT INTO {table} (candidate columns[, extra]) VALUES ...` for `rows`.
fn push_candidate_insert<'a>(
    table: &str,
    extra_column: Option<&str>,
    rows: &'a [DerivedRow],
) -> QueryBuilder<'a, Postgres> {
    let mut columns = CANDIDATE_COLUMNS.join(", ");
    if let Some(extra) = extra_column {
        columns.push_str(", ");
        columns.push_str(extra);
    }
    let mut qb = QueryBuilder::new(format!("INSERT INTO {table} ({columns}) "));
    qb.push_values(rows.iter(), |mut b, row| {
        let c = &row.candidate;
        b.push_bind(c.candidate_id)
            .push_bind(&c.first_name)
            .push_bind(&c.last_name)
            .push_bind(&c.full_name)
            .push_bind(&c.email)
            .push_bind(&c.phone)
            .push_bind(&c.address)
            .push_bind(c.attachments.links())
            .push_bind(c.attachments.filenames())
            .push_bind(&c.employment.titles)
            .push_bind(&c.employment.companies)
            .push_bind(&c.education.degrees)
            .push_bind(&c.applications.job_names)
            .push_bind(&c.resume_content)
            .push_bind(c.created_at)
            .push_bind(c.updated_at)
            .push_bind(&c.raw);
        if extra_column.is_some() {
            b.push_bind(&row.resolved_link);
        }
    });
    qb
}

/// `col = EXCLUDED.col` for every candidate column except the key and the
/// timestamp bounds.
fn overwrite_assignments() -> String {
    CANDIDATE_COLUMNS
        .iter()
        .filter(|c| !matches!(**c, "candidate_id" | "created_at" | "updated_at"))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn write_targets(
    tx: &mut Transaction<'_, Postgres>,
    stage: StageId,
    rows: &[DerivedRow],
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }

    let table = match stage {
        StageId::SharePoint => "gh.sp_candidates",
        StageId::AiAccess => "gh.ai_candidates",
        StageId::Metadata => {
            for row in rows {
                let result = sqlx::query(
                    "UPDATE gh.ai_candidates SET metadata_link = $1 WHERE candidate_id = $2",
                )
                .bind(&row.metadata_link)
                .bind(row.candidate_id())
                .execute(&mut **tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::MissingSource {
                        stage,
                        candidate_id: row.candidate_id(),
                    });
                }
            }
            return Ok(());
        }
    };

    // metadata_link is never in the insert list, so an existing value survives.
    let mut qb = push_candidate_insert(table, Some("resolved_link"), rows);
    qb.push(format!(
        " ON CONFLICT (candidate_id) DO UPDATE SET {}, created_at = EXCLUDED.created_at, \
         updated_at = EXCLUDED.updated_at, resolved_link = EXCLUDED.resolved_link",
        overwrite_assignments()
    ));
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

async fn write_audits(
    tx: &mut Transaction<'_, Postgres>,
    stage: StageId,
    audits: &[MappingAuditRecord],
) -> Result<(), StoreError> {
    if audits.is_empty() {
        return Ok(());
    }

    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {} ({AUDIT_COLUMNS}) ",
        audit_table(stage)
    ));
    qb.push_values(audits.iter(), |mut b, record| {
        b.push_bind(record.candidate_id)
            .push_bind(record.status.as_str())
            .push_bind(&record.resolved_reference)
            .push_bind(&record.error_detail)
            .push_bind(record.attempted_at);
    });
    qb.push(
        " ON CONFLICT (candidate_id) DO UPDATE SET status = EXCLUDED.status, \
         resolved_reference = EXCLUDED.resolved_reference, \
         error_detail = EXCLUDED.error_detail, attempted_at = EXCLUDED.attempted_at",
    );
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

#[async_trait]
impl CandidateStore for PgStore {
    async fn max_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT MAX(updated_at) AS max_updated_at FROM gh.candidates")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("max_updated_at")?)
    }

    async fn upsert_batch(&self, rows: &[CandidateRecord]) -> Result<usize, StoreError> {
        let merged: Vec<DerivedRow> = merge_batch(rows.to_vec())
            .into_iter()
            .map(DerivedRow::projection)
            .collect();
        if merged.is_empty() {
            return Ok(0);
        }

        let mut qb = push_candidate_insert("gh.candidates", None, &merged);
        qb.push(format!(
            " ON CONFLICT (candidate_id) DO UPDATE SET {}, \
             created_at = LEAST(gh.candidates.created_at, EXCLUDED.created_at), \
             updated_at = GREATEST(gh.candidates.updated_at, EXCLUDED.updated_at)",
            overwrite_assignments()
        ));

        let mut tx = self.pool.begin().await?;
        qb.build().execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(rows = merged.len(), "upserted candidate batch");
        Ok(merged.len())
    }

    async fn candidate_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM gh.candidates")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[async_trait]
impl MappingStore for PgStore {
    async fn eligible_page(
        &self,
        stage: StageId,
        after: Option<i64>,
        limit: usize,
        reprocess_terminal: bool,
    ) -> Result<Vec<DerivedRow>, StoreError> {
        let candidate_columns = CANDIDATE_COLUMNS
            .iter()
            .map(|c| format!("s.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {candidate_columns}, {} FROM {} s WHERE s.candidate_id > $1",
            link_columns(stage),
            source_table(stage)
        );
        if let Some(prior) = stage.prior() {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM {} p WHERE p.candidate_id = s.candidate_id \
                 AND p.status = 'success')",
                audit_table(prior)
            ));
        }
        if !reprocess_terminal {
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM {} a WHERE a.candidate_id = s.candidate_id \
                 AND a.status IN ('success', 'no_subject'))",
                audit_table(stage)
            ));
        }
        sql.push_str(" ORDER BY s.candidate_id LIMIT $2");

        let rows = sqlx::query(&sql)
            .bind(after.unwrap_or(i64::MIN))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<DerivedRow, StoreError> {
                Ok(DerivedRow {
                    candidate: candidate_from_row(row)?,
                    resolved_link: row.try_get("resolved_link")?,
                    metadata_link: row.try_get("metadata_link")?,
                })
            })
            .collect()
    }

    async fn commit_page(&self, commit: &PageCommit) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_targets(&mut tx, commit.stage, &commit.rows).await?;
        write_audits(&mut tx, commit.stage, &commit.audits).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn refresh_projections(&self) -> Result<ProjectionRefresh, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sp_rows = sqlx::query(&refresh_sql("gh.sp_candidates"))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let ai_rows = sqlx::query(&refresh_sql("gh.ai_candidates"))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        debug!(sp_rows, ai_rows, "refreshed derived rows");
        Ok(ProjectionRefresh { sp_rows, ai_rows })
    }

    async fn record_attempt(&self, record: &MappingAuditRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_audits(&mut tx, record.stage, std::slice::from_ref(record)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn is_terminal(&self, candidate_id: i64, stage: StageId) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE candidate_id = $1 \
             AND status IN ('success', 'no_subject')) AS terminal",
            audit_table(stage)
        );
        let row = sqlx::query(&sql)
            .bind(candidate_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("terminal")?)
    }

    async fn audit_record(
        &self,
        candidate_id: i64,
        stage: StageId,
    ) -> Result<Option<MappingAuditRecord>, StoreError> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM {} WHERE candidate_id = $1",
            audit_table(stage)
        );
        let row = sqlx::query(&sql)
            .bind(candidate_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|r| audit_from_row(r, stage)).transpose()
    }

    async fn status_counts(&self, stage: StageId) -> Result<StageStatus, StoreError> {
        let sql = format!(
            "SELECT (SELECT COUNT(*) FROM {source}) AS source_rows, \
             COUNT(*) FILTER (WHERE status = 'success') AS success, \
             COUNT(*) FILTER (WHERE status = 'no_subject') AS no_subject, \
             COUNT(*) FILTER (WHERE status = 'failed') AS failed \
             FROM {audit}",
            source = source_table(stage),
            audit = audit_table(stage)
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(StageStatus {
            source_rows: row.try_get("source_rows")?,
            success: row.try_get("success")?,
            no_subject: row.try_get("no_subject")?,
            failed: row.try_get("failed")?,
        })
    }

    async fn failed_records(
        &self,
        stage: StageId,
        limit: usize,
    ) -> Result<Vec<MappingAuditRecord>, StoreError> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM {} WHERE status = 'failed' \
             ORDER BY attempted_at DESC, candidate_id LIMIT $1",
            audit_table(stage)
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| audit_from_row(row, stage)).collect()
    }
}

#[async_trait]
impl TransferStore for PgStore {
    async fn transfer_page(
        &self,
        step: TransferStep,
        after: Option<i64>,
        limit: usize,
        reprocess_terminal: bool,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CandidateRecord>, StoreError> {
        let candidate_columns = CANDIDATE_COLUMNS
            .iter()
            .map(|c| format!("s.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {candidate_columns} FROM gh.candidates s \
             WHERE s.candidate_id > $1 AND cardinality(s.resume_links) > 0 \
             AND ($3::timestamptz IS NULL OR s.updated_at >= $3)"
        );
        if let Some(prior) = step.prior() {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM {} p WHERE p.candidate_id = s.candidate_id \
                 AND p.status = 'success')",
                transfer_table(prior)
            ));
        }
        if !reprocess_terminal {
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM {} a WHERE a.candidate_id = s.candidate_id \
                 AND a.status IN ('success', 'no_subject'))",
                transfer_table(step)
            ));
        }
        sql.push_str(" ORDER BY s.candidate_id LIMIT $2");

        let rows = sqlx::query(&sql)
            .bind(after.unwrap_or(i64::MIN))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(updated_since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn record_transfer(&self, record: &TransferAuditRecord) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} ({TRANSFER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (candidate_id) DO UPDATE SET status = EXCLUDED.status, \
             source_ref = EXCLUDED.source_ref, saved_path = EXCLUDED.saved_path, \
             file_size_bytes = EXCLUDED.file_size_bytes, \
             error_detail = EXCLUDED.error_detail, attempted_at = EXCLUDED.attempted_at",
            transfer_table(record.step)
        );
        sqlx::query(&sql)
            .bind(record.candidate_id)
            .bind(record.status.as_str())
            .bind(&record.source_ref)
            .bind(&record.saved_path)
            .bind(record.file_size_bytes)
            .bind(&record.error_detail)
            .bind(record.attempted_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn transfer_record(
        &self,
        candidate_id: i64,
        step: TransferStep,
    ) -> Result<Option<TransferAuditRecord>, StoreError> {
        let sql = format!(
            "SELECT {TRANSFER_COLUMNS} FROM {} WHERE candidate_id = $1",
            transfer_table(step)
        );
        let row = sqlx::query(&sql)
            .bind(candidate_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|r| transfer_from_row(r, step)).transpose()
    }

    async fn transfer_counts(&self, step: TransferStep) -> Result<StageStatus, StoreError> {
        let sql = format!(
            "SELECT (SELECT COUNT(*) FROM gh.candidates WHERE cardinality(resume_links) > 0) \
             AS source_rows, \
             COUNT(*) FILTER (WHERE status = 'success') AS success, \
             COUNT(*) FILTER (WHERE status = 'no_subject') AS no_subject, \
             COUNT(*) FILTER (WHERE status = 'failed') AS failed \
             FROM {}",
            transfer_table(step)
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(StageStatus {
            source_rows: row.try_get("source_rows")?,
            success: row.try_get("success")?,
            no_subject: row.try_get("no_subject")?,
            failed: row.try_get("failed")?,
        })
    }

    async fn failed_transfers(
        &self,
        step: TransferStep,
        limit: usize,
    ) -> Result<Vec<TransferAuditRecord>, StoreError> {
        let sql = format!(
            "SELECT {TRANSFER_COLUMNS} FROM {} WHERE status = 'failed' \
             ORDER BY attempted_at DESC, candidate_id LIMIT $1",
            transfer_table(step)
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| transfer_from_row(row, step)).collect()
    }
}
