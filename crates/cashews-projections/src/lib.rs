//! Relational projections re-derived from cached game and player payloads.

use std::collections::BTreeMap;

use cashews_core::{canonical_json, kind, ContentHash, CurrentPointer};
use cashews_storage::{CacheStore, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cashews-projections";

/// Typed registry of `player_stats` columns, kept sorted. Stat keys from the
/// remote payload are only ever written through an entry of this list.
pub const PLAYER_STAT_COLUMNS: &[&str] = &[
    "allowed_stolen_bases", "allowed_stolen_bases_risp", "appearances", "assists",
    "assists_risp", "at_bats", "at_bats_risp", "batters_faced", "batters_faced_risp",
    "blown_saves", "caught_double_play", "caught_double_play_risp", "caught_stealing",
    "caught_stealing_risp", "complete_games", "double_plays", "double_plays_risp", "doubles",
    "doubles_risp", "earned_runs", "earned_runs_risp", "errors", "errors_risp", "field_out",
    "field_out_risp", "fielders_choice", "fielders_choice_risp", "flyouts", "flyouts_risp",
    "force_outs", "force_outs_risp", "games_finished", "grounded_into_double_play",
    "grounded_into_double_play_risp", "groundout", "groundout_risp", "hit_batters",
    "hit_batters_risp", "hit_by_pitch", "hit_by_pitch_risp", "hits_allowed",
    "hits_allowed_risp", "home_runs", "home_runs_allowed", "home_runs_allowed_risp",
    "home_runs_risp", "inherited_runners", "inherited_runners_risp", "inherited_runs_allowed",
    "inherited_runs_allowed_risp", "left_on_base", "left_on_base_risp", "lineouts",
    "lineouts_risp", "losses", "mound_visits", "no_hitters", "outs", "pitches_thrown",
    "pitches_thrown_risp", "plate_appearances", "plate_appearances_risp", "popouts",
    "popouts_risp", "putouts", "putouts_risp", "quality_starts", "reached_on_error",
    "reached_on_error_risp", "runners_caught_stealing", "runners_caught_stealing_risp", "runs",
    "runs_batted_in", "runs_batted_in_risp", "runs_risp", "sac_flies", "sac_flies_risp",
    "sacrifice_double_plays", "sacrifice_double_plays_risp", "saves", "shutouts", "singles",
    "singles_risp", "starts", "stolen_bases", "stolen_bases_risp", "strikeouts",
    "strikeouts_risp", "struck_out", "struck_out_risp", "triples", "triples_risp",
    "unearned_runs", "unearned_runs_risp", "walked", "walked_risp", "walks", "walks_risp",
    "wins",
];

pub fn stat_column(key: &str) -> Option<&'static str> {
    PLAYER_STAT_COLUMNS
        .binary_search_by(|probe| (*probe).cmp(key))
        .ok()
        .map(|idx| PLAYER_STAT_COLUMNS[idx])
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{kind} {id} is missing required field {field}")]
    MissingField {
        kind: &'static str,
        id: String,
        field: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionOutcome {
    /// No current payload for the entity yet.
    Missing,
    /// The entity type has no projection.
    NotProjected,
    Game { events: usize, new_events: u64 },
    Player { teams: usize, fields: usize, skipped: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct GameRow {
    pub id: String,
    pub season: i64,
    pub day: i64,
    pub away_team_id: String,
    pub home_team_id: String,
    pub last_update: i64,
    pub state: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct GameEventRow {
    pub game_id: String,
    pub idx: i64,
    pub event: Option<String>,
    pub inning: Option<i64>,
    pub inning_side: Option<i64>,
    pub pitcher: Option<String>,
    pub batter: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerStatLine {
    pub player_id: String,
    pub team_id: String,
    pub last_update: Option<i64>,
    pub stats: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub projected: usize,
    pub failed: usize,
}

/// Re-derive the projection rows of one entity from its current payload.
/// Safe to repeat: an unchanged payload produces the same rows.
pub async fn update_projection(
    store: &CacheStore,
    entity_type: &str,
    entity_id: &str,
) -> Result<ProjectionOutcome, ProjectionError> {
    match entity_type {
        kind::GAME => update_game(store, entity_id).await,
        kind::PLAYER => update_player(store, entity_id).await,
        _ => Ok(ProjectionOutcome::NotProjected),
    }
}

/// Replay every current entity of a type through its projection.
pub async fn rebuild(store: &CacheStore, entity_type: &str) -> Result<RebuildSummary, ProjectionError> {
    let ids = store.get_all_ids(entity_type).await?;
    let total = ids.len();
    let mut summary = RebuildSummary::default();
    for (i, id) in ids.iter().enumerate() {
        match update_projection(store, entity_type, id).await {
            Ok(_) => summary.projected += 1,
            Err(err) => {
                summary.failed += 1;
                warn!(entity_type, id = %id, error = %err, "projection rebuild failed");
            }
        }
        if (i + 1) % 500 == 0 {
            info!(entity_type, done = i + 1, total, "rebuilding projections");
        }
    }
    Ok(summary)
}

async fn current_payload(
    store: &CacheStore,
    entity_type: &str,
    entity_id: &str,
) -> Result<Option<(CurrentPointer, JsonValue)>, ProjectionError> {
    let Some(pointer) = store.get_current(entity_type, entity_id).await? else {
        return Ok(None);
    };
    let data = store.get_object_by_hash(&pointer.hash).await?;
    Ok(Some((pointer, data)))
}

fn required_str<'a>(data: &'a JsonValue, id: &str, field: &'static str) -> Result<&'a str, ProjectionError> {
    data.get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ProjectionError::MissingField {
            kind: kind::GAME,
            id: id.to_string(),
            field,
        })
}

fn required_i64(data: &JsonValue, id: &str, field: &'static str) -> Result<i64, ProjectionError> {
    data.get(field)
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| ProjectionError::MissingField {
            kind: kind::GAME,
            id: id.to_string(),
            field,
        })
}

pub async fn update_game(store: &CacheStore, game_id: &str) -> Result<ProjectionOutcome, ProjectionError> {
    let Some((pointer, data)) = current_payload(store, kind::GAME, game_id).await? else {
        return Ok(ProjectionOutcome::Missing);
    };

    let season = required_i64(&data, game_id, "Season")?;
    let day = required_i64(&data, game_id, "Day")?;
    let away_team_id = required_str(&data, game_id, "AwayTeamID")?;
    let home_team_id = required_str(&data, game_id, "HomeTeamID")?;
    let state = required_str(&data, game_id, "State")?;
    let events = data
        .get("EventLog")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut tx = store.pool().begin().await?;
    sqlx::query(
        "insert into games(id, season, day, away_team_id, home_team_id, last_update, state, hash)
         values (?, ?, ?, ?, ?, ?, ?, ?)
         on conflict (id) do update set season = excluded.season, day = excluded.day,
             away_team_id = excluded.away_team_id, home_team_id = excluded.home_team_id,
             last_update = excluded.last_update, state = excluded.state, hash = excluded.hash",
    )
    .bind(game_id)
    .bind(season)
    .bind(day)
    .bind(away_team_id)
    .bind(home_team_id)
    .bind(pointer.last_update)
    .bind(state)
    .bind(pointer.hash.as_str())
    .execute(&mut *tx)
    .await?;

    let mut new_events = 0u64;
    for (idx, event) in events.iter().enumerate() {
        if !event.is_object() {
            warn!(game_id, idx, "game event is not an object; storing raw data only");
        }
        new_events += sqlx::query(
            "insert into game_events(game_id, idx, event, inning, inning_side, pitcher, batter, data)
             values (?, ?, ?, ?, ?, ?, ?, ?)
             on conflict (game_id, idx) do nothing",
        )
        .bind(game_id)
        .bind(idx as i64)
        .bind(event.get("event").and_then(JsonValue::as_str))
        .bind(event.get("inning").and_then(JsonValue::as_i64))
        .bind(event.get("inning_side").and_then(JsonValue::as_i64))
        .bind(event.get("pitcher").and_then(JsonValue::as_str))
        .bind(event.get("batter").and_then(JsonValue::as_str))
        .bind(canonical_json(event))
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;

    Ok(ProjectionOutcome::Game {
        events: events.len(),
        new_events,
    })
}

/// Column-level upsert: only the listed columns (plus `last_update`) change
/// on conflict, so stats absent from a payload keep their stored values.
pub fn player_stats_upsert_sql(columns: &[&'static str]) -> String {
    let mut insert_cols = String::from("player_id, team_id, last_update");
    let mut placeholders = String::from("?, ?, ?");
    let mut updates = String::from("last_update = excluded.last_update");
    for column in columns {
        insert_cols.push_str(", ");
        insert_cols.push_str(column);
        placeholders.push_str(", ?");
        updates.push_str(&format!(", {column} = excluded.{column}"));
    }
    format!(
        "insert into player_stats({insert_cols}) values ({placeholders}) on conflict (player_id, team_id) do update set {updates}"
    )
}

pub async fn update_player(store: &CacheStore, player_id: &str) -> Result<ProjectionOutcome, ProjectionError> {
    let Some((pointer, data)) = current_payload(store, kind::PLAYER, player_id).await? else {
        return Ok(ProjectionOutcome::Missing);
    };

    let Some(stats) = data.get("Stats").and_then(JsonValue::as_object) else {
        warn!(player_id, "player payload has no Stats object");
        return Ok(ProjectionOutcome::Player {
            teams: 0,
            fields: 0,
            skipped: 0,
        });
    };

    let mut teams = 0usize;
    let mut fields = 0usize;
    let mut skipped = 0usize;

    let mut tx = store.pool().begin().await?;
    for (team_id, team_stats) in stats {
        let Some(team_stats) = team_stats.as_object() else {
            warn!(player_id, team_id = %team_id, "player stats entry is not an object");
            skipped += 1;
            continue;
        };

        let mut columns = Vec::with_capacity(team_stats.len());
        let mut values = Vec::with_capacity(team_stats.len());
        for (key, value) in team_stats {
            let Some(column) = stat_column(key) else {
                warn!(player_id, team_id = %team_id, key = %key, value = %value, "player stat had unknown key");
                skipped += 1;
                continue;
            };
            let Some(value) = value.as_i64() else {
                warn!(player_id, team_id = %team_id, key = %key, value = %value, "player stat is not an integer");
                skipped += 1;
                continue;
            };
            columns.push(column);
            values.push(value);
        }

        let sql = player_stats_upsert_sql(&columns);
        let mut query = sqlx::query(&sql)
            .bind(player_id)
            .bind(team_id.as_str())
            .bind(pointer.last_update);
        for value in values {
            query = query.bind(value);
        }
        query.execute(&mut *tx).await?;

        teams += 1;
        fields += columns.len();
    }
    tx.commit().await?;

    Ok(ProjectionOutcome::Player {
        teams,
        fields,
        skipped,
    })
}

async fn games_with_payloads(
    store: &CacheStore,
    rows: Vec<(String, String)>,
) -> Result<Vec<(String, JsonValue)>, ProjectionError> {
    let mut out = Vec::with_capacity(rows.len());
    for (id, hash) in rows {
        let data = store.get_object_by_hash(&ContentHash::from_hex(hash)).await?;
        out.push((id, data));
    }
    Ok(out)
}

/// The game a team plays on a given season day, with the payload it was projected from.
pub async fn game_for_team(
    store: &CacheStore,
    team_id: &str,
    season: i64,
    day: i64,
) -> Result<Option<(String, JsonValue)>, ProjectionError> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "select id, hash from games where season = ? and day = ? and (home_team_id = ? or away_team_id = ?) limit 1",
    )
    .bind(season)
    .bind(day)
    .bind(team_id)
    .bind(team_id)
    .fetch_all(store.pool())
    .await?;
    Ok(games_with_payloads(store, rows).await?.into_iter().next())
}

pub async fn games_for_team(
    store: &CacheStore,
    team_id: &str,
) -> Result<Vec<(String, JsonValue)>, ProjectionError> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "select id, hash from games where home_team_id = ? or away_team_id = ? order by season, day",
    )
    .bind(team_id)
    .bind(team_id)
    .fetch_all(store.pool())
    .await?;
    games_with_payloads(store, rows).await
}

pub async fn games_on_day(
    store: &CacheStore,
    season: i64,
    day: i64,
) -> Result<Vec<GameRow>, ProjectionError> {
    Ok(sqlx::query_as::<_, GameRow>(
        "select id, season, day, away_team_id, home_team_id, last_update, state, hash from games where season = ? and day = ? order by id",
    )
    .bind(season)
    .bind(day)
    .fetch_all(store.pool())
    .await?)
}

pub async fn game_events(store: &CacheStore, game_id: &str) -> Result<Vec<GameEventRow>, ProjectionError> {
    Ok(sqlx::query_as::<_, GameEventRow>(
        "select game_id, idx, event, inning, inning_side, pitcher, batter, data from game_events where game_id = ? order by idx",
    )
    .bind(game_id)
    .fetch_all(store.pool())
    .await?)
}

/// Per-team stat lines for a player; zero-valued stats are left out.
pub async fn player_stats(
    store: &CacheStore,
    player_id: &str,
) -> Result<Vec<PlayerStatLine>, ProjectionError> {
    let rows = sqlx::query("select * from player_stats where player_id = ? order by team_id")
        .bind(player_id)
        .fetch_all(store.pool())
        .await?;

    let mut lines = Vec::with_capacity(rows.len());
    for row in rows {
        let mut stats = BTreeMap::new();
        for column in PLAYER_STAT_COLUMNS {
            let value: i64 = row.try_get(*column)?;
            if value != 0 {
                stats.insert((*column).to_string(), value);
            }
        }
        lines.push(PlayerStatLine {
            player_id: row.try_get("player_id")?,
            team_id: row.try_get("team_id")?,
            last_update: row.try_get("last_update")?,
            stats,
        });
    }
    Ok(lines)
}
