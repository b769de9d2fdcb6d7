//! Proxy-health and course persistence behind async traits.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classcatch_core::{
    Channel, ChannelHealth, ChannelVerdict, CourseBatch, CourseKey, CourseRecord, ProxyAddr,
    ProxyRecord, ScrapedRow,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("batch rejected: {0}")]
    Conflict(String),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Upsert keyed by address; touches only the given channel.
    async fn record_verdict(
        &self,
        addr: ProxyAddr,
        channel: Channel,
        verdict: ChannelVerdict,
    ) -> Result<(), StoreError>;

    async fn proxies(&self) -> Result<Vec<ProxyRecord>, StoreError>;
}

#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn courses_for_term(&self, term: &str) -> Result<Vec<CourseRecord>, StoreError>;

    /// Commits every create, update and history entry of the batch, or none of them.
    async fn apply_batch(&self, batch: &CourseBatch, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub term: String,
    pub key: CourseKey,
    pub enrollment: i32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    proxies: BTreeMap<ProxyAddr, ProxyRecord>,
    courses: BTreeMap<(String, CourseKey), CourseRecord>,
    history: Vec<HistoryEntry>,
}

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxies(records: impl IntoIterator<Item = ProxyRecord>) -> Self {
        let proxies = records.into_iter().map(|r| (r.addr, r)).collect();
        Self {
            state: Mutex::new(MemoryState {
                proxies,
                ..Default::default()
            }),
        }
    }

    pub async fn insert_course(&self, record: CourseRecord) {
        let mut state = self.state.lock().await;
        state
            .courses
            .insert((record.row.term.clone(), record.key()), record);
    }

    pub async fn proxy(&self, addr: ProxyAddr) -> Option<ProxyRecord> {
        self.state.lock().await.proxies.get(&addr).cloned()
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.state.lock().await.history.clone()
    }

    pub async fn course_count(&self) -> usize {
        self.state.lock().await.courses.len()
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    async fn record_verdict(
        &self,
        addr: ProxyAddr,
        channel: Channel,
        verdict: ChannelVerdict,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .proxies
            .entry(addr)
            .or_insert_with(|| ProxyRecord::new(addr))
            .apply(channel, verdict);
        Ok(())
    }

    async fn proxies(&self) -> Result<Vec<ProxyRecord>, StoreError> {
        Ok(self.state.lock().await.proxies.values().cloned().collect())
    }
}

#[async_trait]
impl CourseStore for MemoryStore {
    async fn courses_for_term(&self, term: &str) -> Result<Vec<CourseRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .courses
            .iter()
            .filter(|((t, _), _)| t == term)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn apply_batch(&self, batch: &CourseBatch, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = |row: &ScrapedRow| (batch.term.clone(), row.key());

        // Validate everything before the first mutation.
        let mut seen = HashSet::new();
        for row in &batch.creates {
            let key = slot(row);
            if state.courses.contains_key(&key) || !seen.insert(key.clone()) {
                return Err(StoreError::Conflict(format!(
                    "{} already exists for term {}",
                    key.1, batch.term
                )));
            }
        }
        for row in &batch.updates {
            let key = slot(row);
            if !state.courses.contains_key(&key) {
                return Err(StoreError::Conflict(format!(
                    "{} missing for term {}",
                    key.1, batch.term
                )));
            }
        }

        for row in batch.creates.iter().chain(&batch.updates) {
            let mut stored = row.clone();
            stored.term = batch.term.clone();
            state.courses.insert(
                slot(row),
                CourseRecord {
                    row: stored,
                    last_updated: at,
                },
            );
        }
        for change in &batch.changes {
            state.history.push(HistoryEntry {
                term: change.term.clone(),
                key: change.key.clone(),
                enrollment: change.new_enrollment,
                recorded_at: at,
            });
        }
        Ok(())
    }
}

/// Postgres-backed store; schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn channel_columns(channel: Channel) -> (&'static str, &'static str) {
    match channel {
        Channel::Requests => ("requests_is_working", "requests_last_verified"),
        Channel::Browser => ("browser_is_working", "browser_last_verified"),
    }
}

fn proxy_from_row(row: &PgRow) -> Result<ProxyRecord, StoreError> {
    let ip: String = row.try_get("ip")?;
    let port: i32 = row.try_get("port")?;
    let port = u16::try_from(port).map_err(|_| StoreError::Corrupt(format!("port {port}")))?;
    let ip = ip
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("ip {ip}")))?;
    let addr = ProxyAddr::new(ip, port).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(ProxyRecord {
        addr,
        requests: ChannelHealth {
            is_working: row.try_get("requests_is_working")?,
            last_verified: row.try_get("requests_last_verified")?,
        },
        browser: ChannelHealth {
            is_working: row.try_get("browser_is_working")?,
            last_verified: row.try_get("browser_last_verified")?,
        },
    })
}

fn course_from_row(row: &PgRow) -> Result<CourseRecord, StoreError> {
    Ok(CourseRecord {
        row: ScrapedRow {
            subject_code: row.try_get("class_code")?,
            course_number: row.try_get("course_number")?,
            section: row.try_get("section")?,
            title: row.try_get("title")?,
            instructor: row.try_get("instructor")?,
            term: row.try_get("term")?,
            limit: row.try_get("seat_limit")?,
            enrollment: row.try_get("enrollment")?,
            distrib: row.try_get("distrib")?,
            world_culture: row.try_get("world_culture")?,
            lang_req: row.try_get("lang_req")?,
            period: row.try_get("period")?,
            period_code: row.try_get("period_code")?,
            status: row.try_get("status")?,
            text: row.try_get("text")?,
            xlist: row.try_get("xlist")?,
            crn: row.try_get("crn")?,
        },
        last_updated: row.try_get("last_updated")?,
    })
}

#[async_trait]
impl ProxyStore for PgStore {
    async fn record_verdict(
        &self,
        addr: ProxyAddr,
        channel: Channel,
        verdict: ChannelVerdict,
    ) -> Result<(), StoreError> {
        let (working, verified) = channel_columns(channel);
        let (is_working, at) = match verdict {
            ChannelVerdict::Working(at) => (true, Some(at)),
            ChannelVerdict::Failed => (false, None),
        };
        let sql = format!(
            "INSERT INTO proxies (ip, port, {working}, {verified}) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (ip, port) DO UPDATE SET \
             {working} = EXCLUDED.{working}, \
             {verified} = COALESCE(EXCLUDED.{verified}, proxies.{verified})"
        );
        sqlx::query(&sql)
            .bind(addr.ip.to_string())
            .bind(i32::from(addr.port))
            .bind(is_working)
            .bind(at)
            .execute(&self.pool)
            .await?;
        debug!(%addr, %channel, is_working, "recorded proxy verdict");
        Ok(())
    }

    async fn proxies(&self) -> Result<Vec<ProxyRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT ip, port, requests_is_working, requests_last_verified, \
             browser_is_working, browser_last_verified FROM proxies",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(proxy_from_row).collect()
    }
}

#[async_trait]
impl CourseStore for PgStore {
    async fn courses_for_term(&self, term: &str) -> Result<Vec<CourseRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT class_code, course_number, section, title, instructor, term, seat_limit, \
             enrollment, distrib, world_culture, lang_req, period, period_code, status, text, \
             xlist, crn, last_updated FROM classes WHERE term = $1",
        )
        .bind(term)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(course_from_row).collect()
    }

    async fn apply_batch(&self, batch: &CourseBatch, at: DateTime<Utc>) -> Result<(), StoreError> {
        // Dropping the transaction on any early return rolls it back.
        let mut tx = self.pool.begin().await?;

        for row in &batch.creates {
            sqlx::query(
                "INSERT INTO classes (class_code, course_number, section, term, title, instructor, \
                 seat_limit, enrollment, distrib, world_culture, lang_req, period, period_code, \
                 status, text, xlist, crn, last_updated) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
            )
            .bind(&row.subject_code)
            .bind(&row.course_number)
            .bind(&row.section)
            .bind(&batch.term)
            .bind(&row.title)
            .bind(&row.instructor)
            .bind(row.limit)
            .bind(row.enrollment)
            .bind(&row.distrib)
            .bind(&row.world_culture)
            .bind(&row.lang_req)
            .bind(&row.period)
            .bind(&row.period_code)
            .bind(&row.status)
            .bind(&row.text)
            .bind(&row.xlist)
            .bind(&row.crn)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        for row in &batch.updates {
            let result = sqlx::query(
                "UPDATE classes SET title = $5, instructor = $6, seat_limit = $7, enrollment = $8, \
                 distrib = $9, world_culture = $10, lang_req = $11, period = $12, period_code = $13, \
                 status = $14, text = $15, xlist = $16, crn = $17, last_updated = $18 \
                 WHERE class_code = $1 AND course_number = $2 AND section = $3 AND term = $4",
            )
            .bind(&row.subject_code)
            .bind(&row.course_number)
            .bind(&row.section)
            .bind(&batch.term)
            .bind(&row.title)
            .bind(&row.instructor)
            .bind(row.limit)
            .bind(row.enrollment)
            .bind(&row.distrib)
            .bind(&row.world_culture)
            .bind(&row.lang_req)
            .bind(&row.period)
            .bind(&row.period_code)
            .bind(&row.status)
            .bind(&row.text)
            .bind(&row.xlist)
            .bind(&row.crn)
            .bind(at)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                return Err(StoreError::Conflict(format!(
                    "{} missing for term {}",
                    row.key(),
                    batch.term
                )));
            }
        }

        for change in &batch.changes {
            sqlx::query(
                "INSERT INTO enrollment_history (class_id, enrollment, recorded_at) \
                 SELECT id, $5, $6 FROM classes \
                 WHERE class_code = $1 AND course_number = $2 AND section = $3 AND term = $4",
            )
            .bind(&change.key.subject_code)
            .bind(&change.key.course_number)
            .bind(&change.key.section)
            .bind(&change.term)
            .bind(change.new_enrollment)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
