//! Content-addressed SQLite cache + HTTP fetch utilities for Cashews.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use cashews_core::{
    content_hash, decode_payload, encode_payload, CodecError, ContentHash, CurrentPointer,
    EntityRecord, Observation,
};
pub use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "cashews-storage";

/// One step of schema history. Entries are append-only: once released, a
/// script is never edited, only followed by new ones.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

const META_BOOTSTRAP: &str = "
create table if not exists meta(
    key integer primary key,
    version integer not null
);
insert or ignore into meta(key, version) values (0, -1);
";

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "core_tables",
        sql: "
create table objects(hash text primary key, data blob not null);
create table observations(type text not null, id text not null, timestamp integer not null, hash text not null);
create table currents(type text not null, id text not null, hash text not null, last_update integer not null, primary key (type, id));
",
    },
    Migration {
        name: "games",
        sql: "
create table games(id text primary key, season integer, day integer, away_team_id text, home_team_id text, last_update integer, state text, hash text);
create index games_season_day on games(season, day);
",
    },
    Migration {
        name: "player_stats",
        sql: "
create table player_stats(
    player_id text not null,
    team_id text not null,
    last_update integer,
    allowed_stolen_bases integer not null default 0,
    allowed_stolen_bases_risp integer not null default 0,
    appearances integer not null default 0,
    assists integer not null default 0,
    assists_risp integer not null default 0,
    at_bats integer not null default 0,
    at_bats_risp integer not null default 0,
    batters_faced integer not null default 0,
    batters_faced_risp integer not null default 0,
    blown_saves integer not null default 0,
    caught_double_play integer not null default 0,
    caught_double_play_risp integer not null default 0,
    caught_stealing integer not null default 0,
    caught_stealing_risp integer not null default 0,
    complete_games integer not null default 0,
    double_plays integer not null default 0,
    double_plays_risp integer not null default 0,
    doubles integer not null default 0,
    doubles_risp integer not null default 0,
    earned_runs integer not null default 0,
    earned_runs_risp integer not null default 0,
    errors integer not null default 0,
    errors_risp integer not null default 0,
    field_out integer not null default 0,
    field_out_risp integer not null default 0,
    fielders_choice integer not null default 0,
    fielders_choice_risp integer not null default 0,
    flyouts integer not null default 0,
    flyouts_risp integer not null default 0,
    force_outs integer not null default 0,
    force_outs_risp integer not null default 0,
    games_finished integer not null default 0,
    grounded_into_double_play integer not null default 0,
    grounded_into_double_play_risp integer not null default 0,
    groundout integer not null default 0,
    groundout_risp integer not null default 0,
    hit_batters integer not null default 0,
    hit_batters_risp integer not null default 0,
    hit_by_pitch integer not null default 0,
    hit_by_pitch_risp integer not null default 0,
    hits_allowed integer not null default 0,
    hits_allowed_risp integer not null default 0,
    home_runs integer not null default 0,
    home_runs_allowed integer not null default 0,
    home_runs_allowed_risp integer not null default 0,
    home_runs_risp integer not null default 0,
    inherited_runners integer not null default 0,
    inherited_runners_risp integer not null default 0,
    inherited_runs_allowed integer not null default 0,
    inherited_runs_allowed_risp integer not null default 0,
    left_on_base integer not null default 0,
    left_on_base_risp integer not null default 0,
    lineouts integer not null default 0,
    lineouts_risp integer not null default 0,
    losses integer not null default 0,
    mound_visits integer not null default 0,
    no_hitters integer not null default 0,
    outs integer not null default 0,
    pitches_thrown integer not null default 0,
    pitches_thrown_risp integer not null default 0,
    plate_appearances integer not null default 0,
    plate_appearances_risp integer not null default 0,
    popouts integer not null default 0,
    popouts_risp integer not null default 0,
    putouts integer not null default 0,
    putouts_risp integer not null default 0,
    quality_starts integer not null default 0,
    reached_on_error integer not null default 0,
    reached_on_error_risp integer not null default 0,
    runners_caught_stealing integer not null default 0,
    runners_caught_stealing_risp integer not null default 0,
    runs integer not null default 0,
    runs_batted_in integer not null default 0,
    runs_batted_in_risp integer not null default 0,
    runs_risp integer not null default 0,
    sac_flies integer not null default 0,
    sac_flies_risp integer not null default 0,
    sacrifice_double_plays integer not null default 0,
    sacrifice_double_plays_risp integer not null default 0,
    saves integer not null default 0,
    shutouts integer not null default 0,
    singles integer not null default 0,
    singles_risp integer not null default 0,
    starts integer not null default 0,
    stolen_bases integer not null default 0,
    stolen_bases_risp integer not null default 0,
    strikeouts integer not null default 0,
    strikeouts_risp integer not null default 0,
    struck_out integer not null default 0,
    struck_out_risp integer not null default 0,
    triples integer not null default 0,
    triples_risp integer not null default 0,
    unearned_runs integer not null default 0,
    unearned_runs_risp integer not null default 0,
    walked integer not null default 0,
    walked_risp integer not null default 0,
    walks integer not null default 0,
    walks_risp integer not null default 0,
    wins integer not null default 0,
    primary key (player_id, team_id)
);
",
    },
    Migration {
        name: "game_events",
        sql: "
create table game_events(
    game_id text not null,
    idx integer not null,
    event text,
    inning integer,
    inning_side integer,
    pitcher text,
    batter text,
    data text not null,
    primary key (game_id, idx)
);
create index observations_type_id on observations(type, id);
",
    },
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("creating store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("object not found: {0}")]
    NotFound(ContentHash),
    #[error("migration {index} ({name}) failed: {source}")]
    Migration {
        index: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("schema version moved from {expected} while migrating")]
    MigrationConflict { expected: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub hash: ContentHash,
    pub inserted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub hash: ContentHash,
    pub previous: Option<CurrentPointer>,
    pub pointer_advanced: bool,
}

impl SaveOutcome {
    /// True when the entity's current payload changed hash.
    pub fn changed(&self) -> bool {
        self.pointer_advanced
            && self
                .previous
                .as_ref()
                .is_some_and(|prev| prev.hash != self.hash)
    }
}

/// Handle over the on-disk cache. Cloning is cheap; every operation checks a
/// connection out of the pool for its own duration only.
#[derive(Debug, Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    /// Open the store and bring the schema up to date. A failing migration is
    /// returned as an error and leaves the stored version where it was.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self::open_unmigrated(path).await?;
        let version = store.apply_migrations(MIGRATIONS).await?;
        info!(version, "store schema ready");
        Ok(store)
    }

    /// Open with only the `meta` table bootstrapped.
    pub async fn open_unmigrated(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;

        sqlx::raw_sql(META_BOOTSTRAP).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar::<_, i64>("select version from meta where key = 0")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Run every script whose index is past the stored version, each in its
    /// own transaction together with the version bump.
    pub async fn apply_migrations(&self, migrations: &[Migration]) -> Result<i64, StoreError> {
        let mut current = self.schema_version().await?;
        for (index, migration) in migrations.iter().enumerate() {
            let index = index as i64;
            if index <= current {
                continue;
            }

            info!(index, name = migration.name, "running migration");
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration.sql)
                .execute(&mut *tx)
                .await
                .map_err(|source| StoreError::Migration {
                    index,
                    name: migration.name,
                    source,
                })?;

            let advanced = sqlx::query("update meta set version = ? where key = 0 and version = ?")
                .bind(index)
                .bind(current)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if advanced != 1 {
                tx.rollback().await?;
                return Err(StoreError::MigrationConflict { expected: current });
            }
            tx.commit().await?;
            current = index;
        }
        Ok(current)
    }

    /// Store a payload under its canonical hash unless it is already present.
    pub async fn put_object(&self, value: &JsonValue) -> Result<PutOutcome, StoreError> {
        let hash = content_hash(value);

        // Only skips the compression work; the insert below is what guards races.
        let present = sqlx::query_scalar::<_, i64>("select 1 from objects where hash = ?")
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if present {
            return Ok(PutOutcome {
                hash,
                inserted: false,
            });
        }

        let blob = encode_payload(value)?;
        let inserted = sqlx::query("insert into objects(hash, data) values (?, ?) on conflict(hash) do nothing")
            .bind(hash.as_str())
            .bind(blob)
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;
        Ok(PutOutcome { hash, inserted })
    }

    pub async fn get_object_by_hash(&self, hash: &ContentHash) -> Result<JsonValue, StoreError> {
        let blob = sqlx::query_scalar::<_, Vec<u8>>("select data from objects where hash = ?")
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(hash.clone()))?;
        Ok(decode_payload(&blob)?)
    }

    pub async fn object_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>("select count(*) from objects")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn append_observation(
        &self,
        entity_type: &str,
        entity_id: &str,
        timestamp: i64,
        hash: &ContentHash,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_observation(&mut *conn, entity_type, entity_id, timestamp, hash).await?;
        Ok(())
    }

    pub async fn observations(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<Observation>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "select hash, timestamp from observations where type = ? and id = ? order by timestamp, rowid",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(hash, timestamp)| Observation {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                timestamp,
                hash: ContentHash::from_hex(hash),
            })
            .collect())
    }

    pub async fn observation_count(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>(
            "select count(*) from observations where type = ? and id = ?",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn get_current(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<CurrentPointer>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(select_current(&mut *conn, entity_type, entity_id).await?)
    }

    /// Point the entity at `hash` if `timestamp` is strictly newer than what is
    /// stored. Returns whether the pointer moved.
    pub async fn upsert_if_newer(
        &self,
        entity_type: &str,
        entity_id: &str,
        hash: &ContentHash,
        timestamp: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(upsert_pointer(&mut *conn, entity_type, entity_id, hash, timestamp).await?)
    }

    /// Write-through save: object first, then observation and pointer together.
    pub async fn save_new_object(
        &self,
        entity_type: &str,
        entity_id: &str,
        value: &JsonValue,
        timestamp: i64,
    ) -> Result<SaveOutcome, StoreError> {
        let put = self.put_object(value).await?;

        let mut tx = self.pool.begin().await?;
        insert_observation(&mut *tx, entity_type, entity_id, timestamp, &put.hash).await?;
        let previous = select_current(&mut *tx, entity_type, entity_id).await?;
        let pointer_advanced =
            upsert_pointer(&mut *tx, entity_type, entity_id, &put.hash, timestamp).await?;
        tx.commit().await?;

        Ok(SaveOutcome {
            hash: put.hash,
            previous,
            pointer_advanced,
        })
    }

    pub async fn get_object(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<JsonValue>, StoreError> {
        let blob = sqlx::query_scalar::<_, Vec<u8>>(
            "select objects.data from currents inner join objects on objects.hash = currents.hash where currents.type = ? and currents.id = ?",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        match blob {
            Some(blob) => Ok(Some(decode_payload(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn get_last_update(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .get_current(entity_type, entity_id)
            .await?
            .map(|pointer| pointer.last_update))
    }

    /// Snapshot of every current entity of a type.
    pub async fn get_all(&self, entity_type: &str) -> Result<Vec<EntityRecord>, StoreError> {
        let rows = sqlx::query_as::<_, (String, Vec<u8>, i64)>(
            "select currents.id, objects.data, currents.last_update from currents inner join objects on objects.hash = currents.hash where currents.type = ?",
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, blob, last_update)| -> Result<EntityRecord, StoreError> {
                Ok(EntityRecord {
                    id,
                    data: decode_payload(&blob)?,
                    last_update,
                })
            })
            .collect()
    }

    pub async fn get_all_ids(&self, entity_type: &str) -> Result<Vec<String>, StoreError> {
        Ok(
            sqlx::query_scalar::<_, String>("select id from currents where type = ?")
                .bind(entity_type)
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

async fn insert_observation(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: &str,
    timestamp: i64,
    hash: &ContentHash,
) -> Result<(), sqlx::Error> {
    sqlx::query("insert into observations(type, id, timestamp, hash) values (?, ?, ?, ?)")
        .bind(entity_type)
        .bind(entity_id)
        .bind(timestamp)
        .bind(hash.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

async fn select_current(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Option<CurrentPointer>, sqlx::Error> {
    let row = sqlx::query_as::<_, (String, i64)>(
        "select hash, last_update from currents where type = ? and id = ?",
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|(hash, last_update)| CurrentPointer {
        hash: ContentHash::from_hex(hash),
        last_update,
    }))
}

async fn upsert_pointer(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: &str,
    hash: &ContentHash,
    timestamp: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "insert into currents(type, id, hash, last_update) values (?, ?, ?, ?)
         on conflict (type, id) do update set hash = excluded.hash, last_update = excluded.last_update
         where excluded.last_update > currents.last_update",
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(hash.as_str())
    .bind(timestamp)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub const RETRYABLE_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if RETRYABLE_STATUSES.contains(&status) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th failure (1-based): `base * attempt^1.5`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = (attempt.max(1) as f64).powf(1.5);
        self.base_delay.mul_f64(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("failed fetching {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        last: String,
    },
    #[error("request limiter closed")]
    LimiterClosed,
}

/// Where pipeline payloads come from. `Ok(None)` is the allowed not-found
/// outcome and is only produced when `allow_not_found` is set.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        allow_not_found: bool,
    ) -> Result<Option<FetchedResponse>, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// Request slots not currently held by an in-flight request.
    pub fn available_slots(&self) -> usize {
        self.limit.available_permits()
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        allow_not_found: bool,
    ) -> Result<Option<FetchedResponse>, FetchError> {
        let attempts = self.backoff.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=attempts {
            // Held for the request only, never across the backoff sleep.
            let permit = self
                .limit
                .acquire()
                .await
                .map_err(|_| FetchError::LimiterClosed)?;
            let started = Instant::now();
            let failure = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if allow_not_found && status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(Some(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                    elapsed: started.elapsed(),
                                }));
                            }
                            Err(err) if classify_reqwest_error(&err) == RetryDisposition::Retryable => {
                                err.to_string()
                            }
                            Err(err) => return Err(FetchError::Request(err)),
                        }
                    } else if classify_status(status) == RetryDisposition::Retryable {
                        format!("http status {status}")
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) if classify_reqwest_error(&err) == RetryDisposition::Retryable => {
                    err.to_string()
                }
                Err(err) => return Err(FetchError::Request(err)),
            };

            drop(permit);
            warn!(attempt, error = %failure, "fetch failed");
            last_failure = failure;
            if attempt < attempts {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }

        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts,
            last: last_failure,
        })
    }
}

#[async_trait]
impl JsonSource for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        allow_not_found: bool,
    ) -> Result<Option<FetchedResponse>, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retry(url, allow_not_found)
            .instrument(span)
            .await
    }
}
