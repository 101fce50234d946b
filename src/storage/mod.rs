use crate::models::CatalogRecord;
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use duckdb::{params, params_from_iter, Connection};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

// ── Schema ────────────────────────────────────────────────────────────────────

// Only the primary key is indexed: DuckDB rejects ON CONFLICT updates of
// columns referenced by a secondary index.
const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS catalog_records (
    id                   BIGINT PRIMARY KEY,
    registration_number  VARCHAR,
    brand                VARCHAR,
    firm                 VARCHAR,
    toxicological_class  VARCHAR,
    active_substances    VARCHAR,
    detail_fetch_failed  BOOLEAN NOT NULL DEFAULT false,
    -- Whole CatalogRecord as JSON; the columns above are search copies
    document             VARCHAR NOT NULL,
    first_seen_at        TIMESTAMP NOT NULL,
    updated_at           TIMESTAMP NOT NULL,
    last_seen_at         TIMESTAMP NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS scrape_run_seq START 1;

CREATE TABLE IF NOT EXISTS scrape_runs (
    id                  INTEGER PRIMARY KEY DEFAULT nextval('scrape_run_seq'),
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    total_processed     INTEGER DEFAULT 0,
    inserted            INTEGER DEFAULT 0,
    updated             INTEGER DEFAULT 0,
    detail_failures     INTEGER DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

// ── Types ─────────────────────────────────────────────────────────────────────

/// What an upsert did. Both false means the stored document was identical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: bool,
    pub updated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SearchField {
    Brand,
    RegistrationNumber,
    Firm,
    ActiveSubstances,
    ToxicologicalClass,
}

impl SearchField {
    pub const ALL: [SearchField; 5] = [
        SearchField::Brand,
        SearchField::RegistrationNumber,
        SearchField::Firm,
        SearchField::ActiveSubstances,
        SearchField::ToxicologicalClass,
    ];

    fn column(self) -> &'static str {
        match self {
            SearchField::Brand => "brand",
            SearchField::RegistrationNumber => "registration_number",
            SearchField::Firm => "firm",
            SearchField::ActiveSubstances => "active_substances",
            SearchField::ToxicologicalClass => "toxicological_class",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SearchMode {
    #[default]
    Contains,
    Prefix,
    Exact,
}

/// Case-insensitive lookup over the denormalised search columns.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub term: String,
    pub fields: Vec<SearchField>,
    pub mode: SearchMode,
    pub limit: usize,
}

impl SearchQuery {
    pub const DEFAULT_LIMIT: usize = 20;
    pub const MIN_TERM_LEN: usize = 2;

    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            fields: SearchField::ALL.to_vec(),
            mode: SearchMode::Contains,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    pub fn fields(mut self, fields: &[SearchField]) -> Self {
        self.fields = fields.to_vec();
        self
    }

    pub fn mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeRun {
    pub id: i64,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub status: String,
    pub total_processed: i64,
    pub inserted: i64,
    pub updated: i64,
    pub detail_failures: i64,
    pub error_msg: Option<String>,
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Catalog records ───────────────────────────────────────────────────────

    /// Whole-document replace keyed by `id`, in one transaction.
    pub fn upsert_record(&self, record: &CatalogRecord) -> Result<UpsertOutcome> {
        let document = serde_json::to_value(record)
            .with_context(|| format!("serialize record {}", record.id))?;
        let now = Utc::now().naive_utc();

        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<String> = match tx.query_row(
            "SELECT document FROM catalog_records WHERE id = ?",
            params![record.id],
            |r| r.get(0),
        ) {
            Ok(doc) => Some(doc),
            Err(duckdb::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e).with_context(|| format!("read record {}", record.id)),
        };

        let outcome = match existing {
            Some(stored) if serde_json::from_str::<Value>(&stored).ok().as_ref() == Some(&document) => {
                tx.execute(
                    "UPDATE catalog_records SET last_seen_at = ? WHERE id = ?",
                    params![now, record.id],
                )
                .with_context(|| format!("touch record {}", record.id))?;
                UpsertOutcome::default()
            }
            existing => {
                tx.execute(
                    r#"INSERT INTO catalog_records
                           (id, registration_number, brand, firm, toxicological_class,
                            active_substances, detail_fetch_failed, document,
                            first_seen_at, updated_at, last_seen_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                       ON CONFLICT (id) DO UPDATE SET
                           registration_number = excluded.registration_number,
                           brand               = excluded.brand,
                           firm                = excluded.firm,
                           toxicological_class = excluded.toxicological_class,
                           active_substances   = excluded.active_substances,
                           detail_fetch_failed = excluded.detail_fetch_failed,
                           document            = excluded.document,
                           updated_at          = excluded.updated_at,
                           last_seen_at        = excluded.last_seen_at"#,
                    params![
                        record.id,
                        record.registration_number,
                        record.brand,
                        record.firm,
                        record.toxicological_class,
                        record.active_substances,
                        record.detail_fetch_failed,
                        document.to_string(),
                        now,
                        now,
                        now,
                    ],
                )
                .with_context(|| format!("upsert record {}", record.id))?;
                let inserted = existing.is_none();
                UpsertOutcome { inserted, updated: !inserted }
            }
        };

        tx.commit()?;
        debug!(id = record.id, ?outcome, "Upserted");
        Ok(outcome)
    }

    pub fn get_document(&self, id: i64) -> Result<Option<Value>> {
        let doc: Option<String> = match self.conn.query_row(
            "SELECT document FROM catalog_records WHERE id = ?",
            params![id],
            |r| r.get(0),
        ) {
            Ok(doc) => Some(doc),
            Err(duckdb::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        doc.map(|d| serde_json::from_str(&d).with_context(|| format!("corrupt document {}", id)))
            .transpose()
    }

    pub fn get_record(&self, id: i64) -> Result<Option<CatalogRecord>> {
        self.get_document(id)?
            .map(|v| serde_json::from_value(v).with_context(|| format!("decode record {}", id)))
            .transpose()
    }

    /// Every stored document as raw JSON text, undecoded.
    pub fn raw_documents(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare("SELECT id, document FROM catalog_records ORDER BY id")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }

    #[cfg(test)]
    pub(crate) fn overwrite_raw_document(&self, id: i64, raw: &str) -> Result<()> {
        self.conn
            .execute("UPDATE catalog_records SET document = ? WHERE id = ?", params![raw, id])?;
        Ok(())
    }

    /// Overwrite only the stored JSON; search columns are left as they are.
    pub fn replace_document(&self, id: i64, document: &Value) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE catalog_records SET document = ?, updated_at = ? WHERE id = ?",
            params![document.to_string(), Utc::now().naive_utc(), id],
        )?;
        anyhow::ensure!(n == 1, "record {} not found", id);
        Ok(())
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<CatalogRecord>> {
        let term = query.term.trim().to_lowercase();
        if term.chars().count() < SearchQuery::MIN_TERM_LEN || query.fields.is_empty() || query.limit == 0 {
            return Ok(vec![]);
        }

        let predicate = match query.mode {
            SearchMode::Contains => "contains(lower({col}), ?)",
            SearchMode::Prefix => "starts_with(lower({col}), ?)",
            SearchMode::Exact => "lower({col}) = ?",
        };
        let clauses: Vec<String> = query
            .fields
            .iter()
            .map(|f| predicate.replace("{col}", f.column()))
            .collect();
        let sql = format!(
            "SELECT id, document FROM catalog_records WHERE {} \
             ORDER BY registration_number DESC NULLS LAST, id LIMIT {}",
            clauses.join(" OR "),
            query.limit
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(query.fields.iter().map(|_| term.as_str())), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, doc) = row?;
            out.push(serde_json::from_str(&doc).with_context(|| format!("decode record {}", id))?);
        }
        Ok(out)
    }

    pub fn record_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM catalog_records")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn partial_count(&self) -> Result<i64> {
        let mut s = self
            .conn
            .prepare("SELECT COUNT(*) FROM catalog_records WHERE detail_fetch_failed")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Scrape run log ────────────────────────────────────────────────────────

    pub fn begin_scrape_run(&self) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO scrape_runs (started_at, status) VALUES (?, 'running') RETURNING id",
            params![Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_scrape_run(
        &self,
        run_id: i64,
        processed: usize,
        inserted: usize,
        updated: usize,
        detail_failures: usize,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"UPDATE scrape_runs SET
               finished_at = ?, status = ?,
               total_processed = ?, inserted = ?, updated = ?, detail_failures = ?,
               error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                processed as i64,
                inserted as i64,
                updated as i64,
                detail_failures as i64,
                error,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn last_scrape_run(&self) -> Result<Option<ScrapeRun>> {
        let res = self.conn.query_row(
            r#"SELECT id, started_at, finished_at, status, total_processed,
                      inserted, updated, detail_failures, error_msg
               FROM scrape_runs ORDER BY id DESC LIMIT 1"#,
            [],
            |r| {
                Ok(ScrapeRun {
                    id: r.get(0)?,
                    started_at: r.get(1)?,
                    finished_at: r.get(2)?,
                    status: r.get(3)?,
                    total_processed: r.get(4)?,
                    inserted: r.get(5)?,
                    updated: r.get(6)?,
                    detail_failures: r.get(7)?,
                    error_msg: r.get(8)?,
                })
            },
        );
        match res {
            Ok(run) => Ok(Some(run)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
