//! Poller orchestration: freshness-gated fetch pipeline, MMOLB jobs and the
//! jittered run-forever loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use cashews_core::{
    kind, league_team_ids, player_name, scan_object_ids, team_name, team_player_ids, Clock,
    EntityRecord, SystemClock, GAME_BY_TEAM_CACHE_INTERVAL_MS, GAME_CACHE_INTERVAL_MS,
    LEAGUE_CACHE_INTERVAL_MS, PLAYER_CACHE_INTERVAL_MS, STATE_CACHE_INTERVAL_MS,
    TEAM_CACHE_INTERVAL_MS, TIME_CACHE_INTERVAL_MS,
};
use cashews_projections::{game_for_team, rebuild, ProjectionError, ProjectionOutcome, RebuildSummary};
use cashews_storage::{
    BackoffPolicy, CacheStore, FetchError, HttpClientConfig, HttpFetcher, JsonSource, StoreError,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

pub const CRATE_NAME: &str = "cashews-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub api_base: String,
    pub data_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_attempts: usize,
    pub pollers_file: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("CASHEWS_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/db.db")),
            api_base: std::env::var("CASHEWS_API")
                .unwrap_or_else(|_| "https://mmolb.com/api".to_string()),
            data_base: std::env::var("CASHEWS_DATA_URL")
                .unwrap_or_else(|_| "https://mmolb.com/data".to_string()),
            user_agent: std::env::var("CASHEWS_USER_AGENT")
                .unwrap_or_else(|_| "cashews/0.1".to_string()),
            http_timeout_secs: std::env::var("CASHEWS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            max_attempts: std::env::var("CASHEWS_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            pollers_file: std::env::var("CASHEWS_POLLERS").ok().map(PathBuf::from),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn load_schedule(&self) -> Result<PollerSchedule> {
        match &self.pollers_file {
            Some(path) => PollerSchedule::from_yaml_file(path),
            None => Ok(PollerSchedule::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PollerSpec {
    pub name: String,
    pub interval_secs: u64,
    #[serde(default = "default_jitter_secs")]
    pub jitter_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_jitter_secs() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PollerSchedule {
    pub pollers: Vec<PollerSpec>,
}

impl Default for PollerSchedule {
    fn default() -> Self {
        let spec = |job: Job, interval_secs: u64| PollerSpec {
            name: job.name().to_string(),
            interval_secs,
            jitter_secs: default_jitter_secs(),
            enabled: true,
        };
        Self {
            pollers: vec![
                spec(Job::FetchGames, 3 * 60),
                spec(Job::FetchLeague, 60),
                spec(Job::FetchPlayers, 90 * 60),
                spec(Job::FetchElection, 5 * 60),
                spec(Job::FetchNewGames, 3 * 60),
                spec(Job::RefetchUnfinished, 3 * 60),
                spec(Job::RefreshPlayers, 30 * 60),
            ],
        }
    }
}

impl PollerSchedule {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let schedule: Self = serde_yaml::from_str(text).context("parsing poller schedule")?;
        for poller in &schedule.pollers {
            if Job::from_name(&poller.name).is_none() {
                return Err(anyhow!("unknown poller {}", poller.name));
            }
        }
        Ok(schedule)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

/// Caller-side knobs for one `fetch_and_save` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Serve from cache while the current pointer is younger than this.
    pub min_age_ms: Option<i64>,
    /// Treat a 404 as a valid "absent" result.
    pub allow_not_found: bool,
}

impl FetchOptions {
    pub fn cached(min_age_ms: i64) -> Self {
        Self {
            min_age_ms: Some(min_age_ms),
            allow_not_found: false,
        }
    }

    pub fn uncached() -> Self {
        Self::default()
    }

    pub fn allow_not_found(mut self) -> Self {
        self.allow_not_found = true;
        self
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed json from {url}: {source}")]
    MalformedJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything one poller needs, passed explicitly: store handle, shared HTTP
/// source, clock and the worker's tracing span.
#[derive(Clone)]
pub struct WorkerContext {
    name: String,
    store: CacheStore,
    source: Arc<dyn JsonSource>,
    clock: Arc<dyn Clock>,
    api_base: String,
    data_base: String,
    span: Span,
}

impl WorkerContext {
    pub fn new(
        name: impl Into<String>,
        store: CacheStore,
        source: Arc<dyn JsonSource>,
        clock: Arc<dyn Clock>,
        api_base: impl Into<String>,
        data_base: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let span = info_span!("worker", name = %name);
        Self {
            name,
            store,
            source,
            clock,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            data_base: data_base.into().trim_end_matches('/').to_string(),
            span,
        }
    }

    pub fn from_config(
        name: impl Into<String>,
        store: CacheStore,
        source: Arc<dyn JsonSource>,
        config: &SyncConfig,
    ) -> Self {
        Self::new(
            name,
            store,
            source,
            Arc::new(SystemClock),
            config.api_base.clone(),
            config.data_base.clone(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    pub fn data_url(&self, path: &str) -> String {
        format!("{}/{}", self.data_base, path.trim_start_matches('/'))
    }

    /// Return the cached payload while it is fresh enough, otherwise fetch,
    /// store and return the new one. `Ok(None)` only for an allowed 404.
    pub async fn fetch_and_save(
        &self,
        entity_type: &str,
        entity_id: &str,
        url: &str,
        options: FetchOptions,
    ) -> Result<Option<JsonValue>, PipelineError> {
        let timestamp = self.clock.now_ms();

        if let Some(min_age_ms) = options.min_age_ms {
            if let Some(pointer) = self.store.get_current(entity_type, entity_id).await? {
                if pointer.last_update + min_age_ms > timestamp {
                    debug!(entity_type, entity_id, "serving cached payload");
                    return Ok(Some(self.store.get_object_by_hash(&pointer.hash).await?));
                }
            }
        }

        let Some(response) = self.source.fetch(url, options.allow_not_found).await? else {
            info!(url, "not found");
            return Ok(None);
        };
        info!(
            url,
            status = response.status.as_u16(),
            took = ?response.elapsed,
            "fetched"
        );

        let data: JsonValue = serde_json::from_slice(&response.body).map_err(|source| {
            PipelineError::MalformedJson {
                url: url.to_string(),
                source,
            }
        })?;

        let saved = self
            .store
            .save_new_object(entity_type, entity_id, &data, timestamp)
            .await?;
        if let (true, Some(previous)) = (saved.changed(), &saved.previous) {
            info!(
                "updated {entity_type}/{entity_id}: {} ({}) -> {}",
                previous.hash.abbrev(),
                previous.last_update,
                saved.hash.abbrev()
            );
        }

        Ok(Some(data))
    }

    /// Store a payload that did not come from the JSON source.
    pub async fn save_object(
        &self,
        entity_type: &str,
        entity_id: &str,
        value: &JsonValue,
    ) -> Result<(), PipelineError> {
        self.store
            .save_new_object(entity_type, entity_id, value, self.clock.now_ms())
            .await?;
        Ok(())
    }

    pub async fn get_object(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<JsonValue>, StoreError> {
        self.store.get_object(entity_type, entity_id).await
    }

    pub async fn get_all(&self, entity_type: &str) -> Result<Vec<EntityRecord>, StoreError> {
        self.store.get_all(entity_type).await
    }

    pub async fn get_all_ids(&self, entity_type: &str) -> Result<Vec<String>, StoreError> {
        self.store.get_all_ids(entity_type).await
    }

    pub async fn get_last_update(&self, entity_type: &str, entity_id: &str) -> Result<Option<i64>, StoreError> {
        self.store.get_last_update(entity_type, entity_id).await
    }

    pub async fn update_projection(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<ProjectionOutcome, ProjectionError> {
        cashews_projections::update_projection(&self.store, entity_type, entity_id).await
    }

    async fn fetch_required(
        &self,
        entity_type: &str,
        entity_id: &str,
        path: &str,
        options: FetchOptions,
    ) -> Result<JsonValue> {
        let url = self.api_url(path);
        self.fetch_and_save(entity_type, entity_id, &url, options)
            .await
            .with_context(|| format!("fetching {url}"))?
            .ok_or_else(|| anyhow!("{url} returned no payload"))
    }
}

fn str_list(value: &JsonValue, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn is_complete(game: &JsonValue) -> bool {
    game.get("State").and_then(JsonValue::as_str) == Some("Complete")
}

pub async fn fetch_state(ctx: &WorkerContext) -> Result<JsonValue> {
    ctx.fetch_required(kind::STATE, "state", "state", FetchOptions::cached(STATE_CACHE_INTERVAL_MS))
        .await
}

pub async fn fetch_time(ctx: &WorkerContext) -> Result<JsonValue> {
    ctx.fetch_required(kind::TIME, "time", "time", FetchOptions::cached(TIME_CACHE_INTERVAL_MS))
        .await
}

pub async fn fetch_all_leagues(ctx: &WorkerContext) -> Result<Vec<JsonValue>> {
    let state = fetch_state(ctx).await?;
    let mut league_ids = str_list(&state, "GreaterLeagues");
    league_ids.extend(str_list(&state, "LesserLeagues"));

    let mut leagues = Vec::with_capacity(league_ids.len());
    for league_id in league_ids {
        let league = ctx
            .fetch_required(
                kind::LEAGUE,
                &league_id,
                &format!("league/{league_id}"),
                FetchOptions::cached(LEAGUE_CACHE_INTERVAL_MS),
            )
            .await?;
        leagues.push(league);
    }
    Ok(leagues)
}

/// Every team of every league, keyed by id. Also refreshes state and leagues.
pub async fn fetch_all_teams(ctx: &WorkerContext) -> Result<Vec<(String, JsonValue)>> {
    let mut teams = Vec::new();
    for league in fetch_all_leagues(ctx).await? {
        for team_id in league_team_ids(&league) {
            let team = ctx
                .fetch_required(
                    kind::TEAM,
                    &team_id,
                    &format!("team/{team_id}"),
                    FetchOptions::cached(TEAM_CACHE_INTERVAL_MS),
                )
                .await?;
            teams.push((team_id, team));
        }
    }
    Ok(teams)
}

/// Fetch a player and refresh its stat projection. Projection failures are
/// logged, never returned.
pub async fn fetch_player_and_update(
    ctx: &WorkerContext,
    player_id: &str,
    min_age_ms: i64,
) -> Result<JsonValue> {
    let player = ctx
        .fetch_required(
            kind::PLAYER,
            player_id,
            &format!("player/{player_id}"),
            FetchOptions::cached(min_age_ms),
        )
        .await?;
    if let Err(err) = ctx.update_projection(kind::PLAYER, player_id).await {
        error!(player_id, error = %err, "failed to update player data");
    }
    Ok(player)
}

async fn fetch_word_list(ctx: &WorkerContext, entity_type: &str, file: &str) -> Result<()> {
    let url = ctx.data_url(file);
    let response = ctx
        .source
        .fetch(&url, false)
        .await
        .with_context(|| format!("fetching {url}"))?
        .ok_or_else(|| anyhow!("{url} returned no payload"))?;
    let text = String::from_utf8_lossy(&response.body);
    let words: Vec<JsonValue> = text
        .lines()
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .map(|w| JsonValue::String(w.to_string()))
        .collect();
    ctx.save_object(entity_type, entity_type, &JsonValue::Array(words))
        .await?;
    Ok(())
}

pub async fn fetch_league(ctx: &WorkerContext) -> Result<()> {
    fetch_time(ctx).await?;

    fetch_word_list(ctx, kind::NOUNS, "nouns.txt").await?;
    fetch_word_list(ctx, kind::ADJECTIVES, "adjectives.txt").await?;

    ctx.fetch_required(kind::NEWS, "news", "news", FetchOptions::uncached())
        .await?;
    ctx.fetch_required(kind::SPOTLIGHT, "spotlight", "spotlight", FetchOptions::uncached())
        .await?;

    let seen_teams: Vec<String> = fetch_all_teams(ctx)
        .await?
        .into_iter()
        .map(|(id, _)| id)
        .collect();

    fetch_new_players(ctx).await?;

    for team_id in ctx.get_all_ids(kind::TEAM).await? {
        if seen_teams.contains(&team_id) {
            continue;
        }
        let url = ctx.api_url(&format!("team/{team_id}"));
        let team = ctx
            .fetch_and_save(
                kind::TEAM,
                &team_id,
                &url,
                FetchOptions::cached(TEAM_CACHE_INTERVAL_MS).allow_not_found(),
            )
            .await?;
        info!(
            team_id = %team_id,
            found = team.is_some(),
            "known team missing from leagues, fetched anyway"
        );
    }
    Ok(())
}

pub async fn fetch_election(ctx: &WorkerContext) -> Result<()> {
    ctx.fetch_required(kind::ELECTION, "election", "election", FetchOptions::uncached())
        .await?;
    Ok(())
}

pub async fn fetch_new_players(ctx: &WorkerContext) -> Result<()> {
    let known_players = ctx.get_all_ids(kind::PLAYER).await?;
    for team in ctx.get_all(kind::TEAM).await? {
        for player_id in team_player_ids(&team.data) {
            if known_players.contains(&player_id) {
                continue;
            }
            info!(player_id = %player_id, team_id = %team.id, "found new player");
            fetch_player_and_update(ctx, &player_id, PLAYER_CACHE_INTERVAL_MS).await?;
        }
    }
    Ok(())
}

pub async fn fetch_players(ctx: &WorkerContext) -> Result<()> {
    let mut all_players = Vec::new();
    for team in ctx.get_all(kind::TEAM).await? {
        let player_ids = team_player_ids(&team.data);
        info!(team_id = %team.id, count = player_ids.len(), "got players from team");
        all_players.extend(player_ids);
    }

    let total = all_players.len();
    for (i, player_id) in all_players.iter().enumerate() {
        let player = fetch_player_and_update(ctx, player_id, PLAYER_CACHE_INTERVAL_MS).await?;
        info!("fetched player: {} ({}/{})", player_name(&player), i + 1, total);
    }
    Ok(())
}

/// Only players gone long enough to look abandoned are refetched.
pub async fn refresh_known_players(ctx: &WorkerContext) -> Result<()> {
    for player_id in ctx.get_all_ids(kind::PLAYER).await? {
        fetch_player_and_update(ctx, &player_id, PLAYER_CACHE_INTERVAL_MS * 4).await?;
    }
    Ok(())
}

pub async fn fetch_games(ctx: &WorkerContext, new_only: bool) -> Result<()> {
    let time = fetch_time(ctx).await?;
    let season = time
        .get("season_number")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| anyhow!("time payload has no season_number"))?;
    let day = time
        .get("season_day")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| anyhow!("time payload has no season_day"))?;

    for team in ctx.get_all(kind::TEAM).await? {
        let game_id = match game_for_team(ctx.store(), &team.id, season, day).await? {
            Some((game_id, existing)) => {
                if is_complete(&existing) {
                    info!(game_id = %game_id, "already have complete game, skipping");
                    continue;
                }
                if new_only {
                    continue;
                }
                game_id
            }
            None => {
                let url = ctx.api_url(&format!("game-by-team/{}", team.id));
                let game_by_team = ctx
                    .fetch_and_save(
                        kind::GAME_BY_TEAM,
                        &team.id,
                        &url,
                        FetchOptions::cached(GAME_BY_TEAM_CACHE_INTERVAL_MS).allow_not_found(),
                    )
                    .await?;
                let Some(game_id) = game_by_team
                    .as_ref()
                    .and_then(|g| g.get("game_id"))
                    .and_then(JsonValue::as_str)
                else {
                    info!(
                        team_id = %team.id,
                        team = %team_name(&team.data),
                        "team did not have game today"
                    );
                    continue;
                };
                game_id.to_string()
            }
        };

        refetch_game(ctx, &game_id).await?;
    }
    Ok(())
}

pub async fn refetch_unfinished_games(ctx: &WorkerContext) -> Result<()> {
    for game in ctx.get_all(kind::GAME).await? {
        if !is_complete(&game.data) {
            refetch_game(ctx, &game.id).await?;
        }
    }
    Ok(())
}

/// Refetch a game and its projection. When this fetch is the one that sees
/// the game complete, both rosters are refetched uncached.
pub async fn refetch_game(ctx: &WorkerContext, game_id: &str) -> Result<JsonValue> {
    let last_data = ctx.get_object(kind::GAME, game_id).await?;

    let new_game = ctx
        .fetch_required(
            kind::GAME,
            game_id,
            &format!("game/{game_id}"),
            FetchOptions::cached(GAME_CACHE_INTERVAL_MS),
        )
        .await?;
    ctx.update_projection(kind::GAME, game_id).await?;

    let just_completed =
        last_data.as_ref().is_some_and(|last| !is_complete(last)) && is_complete(&new_game);
    if just_completed {
        info!(game_id, "game just completed, refetching team players");
        if let Err(err) = refetch_team_players(ctx, &new_game, 0).await {
            error!(game_id, error = ?err, "error refetching team players");
        }
    }
    Ok(new_game)
}

async fn refetch_team_players(ctx: &WorkerContext, game: &JsonValue, min_age_ms: i64) -> Result<()> {
    for key in ["HomeTeamID", "AwayTeamID"] {
        let Some(team_id) = game.get(key).and_then(JsonValue::as_str) else {
            continue;
        };
        let Some(team) = ctx.get_object(kind::TEAM, team_id).await? else {
            warn!(team_id, "team not cached, cannot refetch its players");
            continue;
        };
        for player_id in team_player_ids(&team) {
            fetch_player_and_update(ctx, &player_id, min_age_ms).await?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub found: usize,
    pub missing: usize,
}

/// Fetch every game id mentioned in `text`, uncached, tolerating unknown ids.
pub async fn backfill_game_ids(ctx: &WorkerContext, text: &str) -> Result<BackfillSummary> {
    let mut summary = BackfillSummary::default();
    for game_id in scan_object_ids(text) {
        let url = ctx.api_url(&format!("game/{game_id}"));
        let game = ctx
            .fetch_and_save(kind::GAME, &game_id, &url, FetchOptions::uncached().allow_not_found())
            .await?;
        match game {
            Some(game) => {
                summary.found += 1;
                info!(
                    game_id = %game_id,
                    state = game.get("State").and_then(JsonValue::as_str).unwrap_or("?"),
                    "backfilled game"
                );
                ctx.update_projection(kind::GAME, &game_id).await?;
            }
            None => {
                summary.missing += 1;
                warn!(game_id = %game_id, "couldn't find game");
            }
        }
    }
    Ok(summary)
}

pub async fn backfill_player_data(ctx: &WorkerContext) -> Result<RebuildSummary> {
    Ok(rebuild(ctx.store(), kind::PLAYER).await?)
}

pub async fn rebuild_games(ctx: &WorkerContext) -> Result<RebuildSummary> {
    Ok(rebuild(ctx.store(), kind::GAME).await?)
}

/// The periodic jobs a poller can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    FetchGames,
    FetchNewGames,
    FetchLeague,
    FetchPlayers,
    FetchElection,
    RefetchUnfinished,
    RefreshPlayers,
}

impl Job {
    pub const ALL: [Job; 7] = [
        Job::FetchGames,
        Job::FetchNewGames,
        Job::FetchLeague,
        Job::FetchPlayers,
        Job::FetchElection,
        Job::RefetchUnfinished,
        Job::RefreshPlayers,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Job::FetchGames => "fetch_games",
            Job::FetchNewGames => "fetch_new_games",
            Job::FetchLeague => "fetch_league",
            Job::FetchPlayers => "fetch_players",
            Job::FetchElection => "fetch_election",
            Job::RefetchUnfinished => "refetch_unfinished",
            Job::RefreshPlayers => "refetch_players",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|job| job.name() == name)
    }

    pub async fn run(&self, ctx: &WorkerContext) -> Result<()> {
        match self {
            Job::FetchGames => fetch_games(ctx, false).await,
            Job::FetchNewGames => fetch_games(ctx, true).await,
            Job::FetchLeague => fetch_league(ctx).await,
            Job::FetchPlayers => fetch_players(ctx).await,
            Job::FetchElection => fetch_election(ctx).await,
            Job::RefetchUnfinished => refetch_unfinished_games(ctx).await,
            Job::RefreshPlayers => refresh_known_players(ctx).await,
        }
    }
}

/// Sleep before the next round: missed rounds are skipped, then a jitter in
/// `[jitter/2, 3*jitter/2)` is added. `unit` is a uniform sample in `[0, 1)`.
pub fn next_sleep(interval: Duration, took: Duration, jitter: Duration, unit: f64) -> (Duration, u32) {
    let interval_secs = interval.as_secs_f64();
    let mut remaining = interval_secs - took.as_secs_f64();
    let mut missed = 0u32;
    while remaining < 0.0 && interval_secs > 0.0 {
        missed += 1;
        remaining += interval_secs;
    }
    let jitter_secs = jitter.as_secs_f64();
    remaining += unit * jitter_secs + jitter_secs / 2.0;
    (Duration::from_secs_f64(remaining.max(0.0)), missed)
}

/// One iteration with every error caught and logged. Returns whether it succeeded.
pub async fn run_iteration(ctx: &WorkerContext, job: Job) -> bool {
    let started = Instant::now();
    info!("running");
    let ok = match job.run(ctx).await {
        Ok(()) => true,
        Err(err) => {
            error!(error = ?err, "error running task");
            false
        }
    };
    info!(took = ?started.elapsed(), "done");
    ok
}

/// Run a job forever on its schedule. Never returns.
pub async fn run_poller(ctx: WorkerContext, spec: PollerSpec, job: Job, presleep: bool) {
    let span = ctx.span().clone();
    async move {
        let interval = Duration::from_secs(spec.interval_secs);
        let jitter = Duration::from_secs(spec.jitter_secs);

        if presleep {
            let presleep = jitter.mul_f64(rand::random::<f64>());
            info!(secs = presleep.as_secs_f64(), "pre-sleeping");
            tokio::time::sleep(presleep).await;
        }

        loop {
            let started = Instant::now();
            run_iteration(&ctx, job).await;
            let (sleep_for, missed) = next_sleep(interval, started.elapsed(), jitter, rand::random::<f64>());
            if missed > 0 {
                info!(missed, "missed rounds, skipping");
            }
            info!(secs = sleep_for.as_secs_f64(), "sleeping");
            tokio::time::sleep(sleep_for).await;
        }
    }
    .instrument(span)
    .await
}

/// Open the store, then spawn one task per enabled poller (or just `only`)
/// and run until ctrl-c. A failing migration aborts before any poller starts.
pub async fn run_pollers(config: &SyncConfig, only: Option<&str>) -> Result<()> {
    let schedule = config.load_schedule()?;
    let store = CacheStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening store {}", config.database_path.display()))?;
    let source: Arc<dyn JsonSource> = Arc::new(HttpFetcher::new(config.http_client_config())?);

    let mut tasks = JoinSet::new();
    for spec in schedule.pollers {
        if let Some(only) = only {
            if spec.name != only {
                continue;
            }
        } else if !spec.enabled {
            warn!(poller = %spec.name, "skipping disabled poller");
            continue;
        }
        let Some(job) = Job::from_name(&spec.name) else {
            return Err(anyhow!("unknown poller {}", spec.name));
        };
        let ctx = WorkerContext::from_config(
            format!("tasks.{}", spec.name),
            store.clone(),
            source.clone(),
            config,
        );
        tasks.spawn(run_poller(ctx, spec, job, only.is_none()));
    }

    if tasks.is_empty() {
        return Err(anyhow!("no pollers to run"));
    }
    info!(pollers = tasks.len(), "pollers started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            tasks.abort_all();
        }
        Some(joined) = tasks.join_next() => {
            tasks.abort_all();
            return match joined {
                Err(err) => Err(anyhow!("poller task ended: {err}")),
                Ok(()) => Err(anyhow!("poller task returned")),
            };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_adds_jitter_to_remaining_interval() {
        let (sleep, missed) = next_sleep(
            Duration::from_secs(60),
            Duration::from_secs(10),
            Duration::from_secs(20),
            0.5,
        );
        assert_eq!(missed, 0);
        assert_eq!(sleep, Duration::from_secs(70));
    }

    #[test]
    fn overrunning_iterations_skip_missed_rounds() {
        let (sleep, missed) = next_sleep(
            Duration::from_secs(60),
            Duration::from_secs(130),
            Duration::ZERO,
            0.9,
        );
        assert_eq!(missed, 2);
        assert_eq!(sleep, Duration::from_secs(50));
    }

    #[test]
    fn job_names_round_trip() {
        for job in Job::ALL {
            assert_eq!(Job::from_name(job.name()), Some(job));
        }
        assert_eq!(Job::from_name("lookup_locations"), None);
    }

    #[test]
    fn default_schedule_covers_every_job() {
        let schedule = PollerSchedule::default();
        assert_eq!(schedule.pollers.len(), Job::ALL.len());
        let league = schedule
            .pollers
            .iter()
            .find(|p| p.name == "fetch_league")
            .expect("league poller");
        assert_eq!(league.interval_secs, 60);
        assert_eq!(league.jitter_secs, 60);
    }

    #[test]
    fn schedule_yaml_fills_defaults_and_rejects_unknown_pollers() {
        let schedule = PollerSchedule::from_yaml_str(
            "pollers:\n  - name: fetch_games\n    interval_secs: 30\n  - name: fetch_election\n    interval_secs: 600\n    jitter_secs: 5\n    enabled: false\n",
        )
        .expect("parse");
        assert_eq!(schedule.pollers[0].jitter_secs, 60);
        assert!(schedule.pollers[0].enabled);
        assert!(!schedule.pollers[1].enabled);

        assert!(PollerSchedule::from_yaml_str("pollers:\n  - name: geocode\n    interval_secs: 1\n").is_err());
    }

    #[test]
    fn fetch_options_builders() {
        assert_eq!(FetchOptions::uncached(), FetchOptions::default());
        let opts = FetchOptions::cached(500).allow_not_found();
        assert_eq!(opts.min_age_ms, Some(500));
        assert!(opts.allow_not_found);
    }
}
