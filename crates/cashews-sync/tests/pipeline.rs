use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cashews_core::{content_hash, Clock};
use cashews_projections::{game_events, games_on_day};
use cashews_storage::{CacheStore, FetchError, FetchedResponse, JsonSource, StatusCode};
use cashews_sync::{
    backfill_game_ids, fetch_games, fetch_league, refetch_game, run_iteration, FetchOptions, Job,
    PipelineError, WorkerContext,
};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

const API: &str = "http://api.test";
const DATA: &str = "http://data.test";

#[derive(Clone)]
enum Reply {
    Json(Value),
    Text(&'static str),
    NotFound,
    Status(u16),
}

/// Replies are queued per url; the last one repeats once the queue is drained.
#[derive(Default)]
struct ScriptedSource {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSource {
    fn on(&self, path: &str, reply: Reply) {
        let url = if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{API}/{path}")
        };
        self.replies.lock().unwrap().entry(url).or_default().push_back(reply);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_to(&self, path: &str) -> usize {
        let url = format!("{API}/{path}");
        self.calls().iter().filter(|c| **c == url).count()
    }
}

#[async_trait]
impl JsonSource for ScriptedSource {
    async fn fetch(
        &self,
        url: &str,
        allow_not_found: bool,
    ) -> Result<Option<FetchedResponse>, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let reply = {
            let mut replies = self.replies.lock().unwrap();
            let queue = replies.get_mut(url);
            match queue {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        let body = match reply {
            Some(Reply::Json(value)) => serde_json::to_vec(&value).unwrap(),
            Some(Reply::Text(text)) => text.as_bytes().to_vec(),
            Some(Reply::NotFound) if allow_not_found => return Ok(None),
            Some(Reply::NotFound) => {
                return Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
            }
            Some(Reply::Status(status)) => {
                return Err(FetchError::HttpStatus {
                    status,
                    url: url.to_string(),
                })
            }
            None => {
                return Err(FetchError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: 1,
                    last: "no scripted reply".to_string(),
                })
            }
        };
        Ok(Some(FetchedResponse {
            status: StatusCode::OK,
            final_url: url.to_string(),
            body,
            elapsed: Duration::from_millis(3),
        }))
    }
}

#[derive(Default)]
struct ManualClock(AtomicI64);

impl ManualClock {
    fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct Harness {
    _dir: TempDir,
    store: CacheStore,
    source: Arc<ScriptedSource>,
    clock: Arc<ManualClock>,
    ctx: WorkerContext,
}

async fn harness() -> Harness {
    let dir = tempdir().expect("tempdir");
    let store = CacheStore::open(dir.path().join("db.db")).await.expect("open");
    let source = Arc::new(ScriptedSource::default());
    let clock = Arc::new(ManualClock::default());
    let ctx = WorkerContext::new(
        "tasks.test",
        store.clone(),
        source.clone(),
        clock.clone(),
        API,
        DATA,
    );
    Harness {
        _dir: dir,
        store,
        source,
        clock,
        ctx,
    }
}

fn url(path: &str) -> String {
    format!("{API}/{path}")
}

#[tokio::test]
async fn fresh_pointer_serves_cache_without_network() {
    let h = harness().await;
    h.source.on("team/t1", Reply::Json(json!({"Name": "Pies", "v": 1})));

    h.clock.set(1_000);
    let first = h
        .ctx
        .fetch_and_save("team", "t1", &url("team/t1"), FetchOptions::cached(500))
        .await
        .expect("fetch")
        .expect("present");

    h.clock.set(1_400);
    let second = h
        .ctx
        .fetch_and_save("team", "t1", &url("team/t1"), FetchOptions::cached(500))
        .await
        .expect("fetch")
        .expect("present");
    assert_eq!(first, second);
    assert_eq!(h.source.calls_to("team/t1"), 1);
    assert_eq!(h.store.observation_count("team", "t1").await.expect("count"), 1);

    h.clock.set(1_500);
    h.ctx
        .fetch_and_save("team", "t1", &url("team/t1"), FetchOptions::cached(500))
        .await
        .expect("fetch");
    assert_eq!(h.source.calls_to("team/t1"), 2);

    // Zero min age always goes to the network.
    h.ctx
        .fetch_and_save("team", "t1", &url("team/t1"), FetchOptions::cached(0))
        .await
        .expect("fetch");
    assert_eq!(h.source.calls_to("team/t1"), 3);
}

#[tokio::test]
async fn unchanged_payload_adds_observation_not_object() {
    let h = harness().await;
    let v1 = json!({"Name": "Pies", "Wins": 1});
    let v2 = json!({"Name": "Pies", "Wins": 2});
    h.source.on("team/t1", Reply::Json(v1.clone()));
    h.source.on("team/t1", Reply::Json(v1.clone()));
    h.source.on("team/t1", Reply::Json(v2.clone()));

    for (ts, expected_objects) in [(0, 1), (100, 1), (500, 2)] {
        h.clock.set(ts);
        h.ctx
            .fetch_and_save("team", "t1", &url("team/t1"), FetchOptions::uncached())
            .await
            .expect("fetch");
        assert_eq!(h.store.object_count().await.expect("objects"), expected_objects);
    }

    let observations = h.store.observations("team", "t1").await.expect("observations");
    assert_eq!(observations.len(), 3);
    assert_eq!(observations[0].hash, content_hash(&v1));
    assert_eq!(observations[1].hash, content_hash(&v1));
    assert_eq!(observations[2].hash, content_hash(&v2));

    let current = h.store.get_current("team", "t1").await.expect("current").expect("pointer");
    assert_eq!(current.hash, content_hash(&v2));
    assert_eq!(current.last_update, 500);
}

#[tokio::test]
async fn allowed_not_found_writes_nothing() {
    let h = harness().await;
    h.source.on("game-by-team/t1", Reply::NotFound);

    let result = h
        .ctx
        .fetch_and_save(
            "game-by-team",
            "t1",
            &url("game-by-team/t1"),
            FetchOptions::uncached().allow_not_found(),
        )
        .await
        .expect("fetch");
    assert!(result.is_none());
    assert_eq!(h.store.object_count().await.expect("objects"), 0);
    assert!(h.store.get_current("game-by-team", "t1").await.expect("current").is_none());
}

#[tokio::test]
async fn malformed_json_is_fatal_and_not_stored() {
    let h = harness().await;
    h.source.on("team/t1", Reply::Text("<html>gateway</html>"));

    let err = h
        .ctx
        .fetch_and_save("team", "t1", &url("team/t1"), FetchOptions::uncached())
        .await
        .expect_err("malformed");
    assert!(matches!(err, PipelineError::MalformedJson { .. }));
    assert_eq!(h.source.calls_to("team/t1"), 1);
    assert_eq!(h.store.object_count().await.expect("objects"), 0);
}

#[tokio::test]
async fn fatal_status_leaves_pointer_untouched() {
    let h = harness().await;
    h.source.on("team/t1", Reply::Json(json!({"v": 1})));
    h.source.on("team/t1", Reply::Status(400));

    h.clock.set(10);
    h.ctx
        .fetch_and_save("team", "t1", &url("team/t1"), FetchOptions::uncached())
        .await
        .expect("first fetch");
    h.clock.set(20);
    let err = h
        .ctx
        .fetch_and_save("team", "t1", &url("team/t1"), FetchOptions::uncached())
        .await
        .expect_err("bad request");
    assert!(matches!(
        err,
        PipelineError::Fetch(FetchError::HttpStatus { status: 400, .. })
    ));
    assert_eq!(h.store.get_last_update("team", "t1").await.expect("last"), Some(10));
}

fn team(players: &[&str]) -> Value {
    let players: Vec<Value> = players.iter().map(|id| json!({"PlayerID": id})).collect();
    json!({"Location": "Sand", "Name": "Pies", "Players": players})
}

fn game(state: &str) -> Value {
    json!({
        "Season": 3,
        "Day": 40,
        "AwayTeamID": "away",
        "HomeTeamID": "home",
        "State": state,
        "EventLog": [{"event": "PlayBall", "inning": 1, "inning_side": 0, "pitcher": "P", "batter": "B"}],
    })
}

#[tokio::test]
async fn completed_game_refetches_both_rosters_uncached() {
    let h = harness().await;
    h.clock.set(1_000_000);
    h.ctx.save_object("team", "home", &team(&["h1"])).await.expect("save");
    h.ctx.save_object("team", "away", &team(&["a1", "#slot"])).await.expect("save");
    h.ctx.save_object("player", "h1", &json!({"Stats": {}})).await.expect("save");
    h.ctx.save_object("player", "a1", &json!({"Stats": {}})).await.expect("save");
    h.ctx.save_object("game", "g1", &game("Started")).await.expect("save");

    h.source.on("game/g1", Reply::Json(game("Complete")));
    h.source.on("player/h1", Reply::Json(json!({"Stats": {"home": {"singles": 2}}})));
    h.source.on("player/a1", Reply::Json(json!({"Stats": {"away": {"outs": 3}}})));

    // The game pointer is fresh, so move past its cache interval first.
    h.clock.set(1_000_000 + 6 * 60 * 1000);
    let new_game = refetch_game(&h.ctx, "g1").await.expect("refetch");
    assert_eq!(new_game["State"], "Complete");

    assert_eq!(h.source.calls_to("player/h1"), 1);
    assert_eq!(h.source.calls_to("player/a1"), 1);
    let games = games_on_day(&h.store, 3, 40).await.expect("games");
    assert_eq!(games.len(), 1);
    assert_eq!(games[0].state, "Complete");
    assert_eq!(game_events(&h.store, "g1").await.expect("events").len(), 1);

    // Already complete: no second roster refresh.
    h.clock.set(1_000_000 + 12 * 60 * 1000);
    refetch_game(&h.ctx, "g1").await.expect("refetch");
    assert_eq!(h.source.calls_to("player/h1"), 1);
}

#[tokio::test]
async fn fetch_games_discovers_todays_game_through_team_lookup() {
    let h = harness().await;
    h.ctx.save_object("team", "home", &team(&[])).await.expect("save");
    h.ctx.save_object("team", "idle", &team(&[])).await.expect("save");

    h.source.on("time", Reply::Json(json!({"season_number": 3, "season_day": 40})));
    h.source.on("game-by-team/home", Reply::Json(json!({"game_id": "g1"})));
    h.source.on("game-by-team/idle", Reply::NotFound);
    h.source.on("game/g1", Reply::Json(game("Started")));

    fetch_games(&h.ctx, false).await.expect("fetch games");
    assert_eq!(h.source.calls_to("game/g1"), 1);
    assert_eq!(games_on_day(&h.store, 3, 40).await.expect("games").len(), 1);

    // Known game for today: new_only skips it, no further lookups.
    fetch_games(&h.ctx, true).await.expect("fetch new games");
    assert_eq!(h.source.calls_to("game/g1"), 1);
    assert_eq!(h.source.calls_to("game-by-team/home"), 1);
}

#[tokio::test]
async fn league_job_stores_word_lists_and_roster() {
    let h = harness().await;
    h.source.on("time", Reply::Json(json!({"season_number": 3, "season_day": 1})));
    h.source.on(&format!("{DATA}/nouns.txt"), Reply::Text("Pies\nDough\n\n"));
    h.source.on(&format!("{DATA}/adjectives.txt"), Reply::Text("Flaky\n"));
    h.source.on("news", Reply::Json(json!([])));
    h.source.on("spotlight", Reply::Json(json!({})));
    h.source.on("state", Reply::Json(json!({"GreaterLeagues": ["l1"], "LesserLeagues": []})));
    h.source.on("league/l1", Reply::Json(json!({"Teams": ["t1"], "SuperstarTeam": null})));
    h.source.on("team/t1", Reply::Json(team(&["p1"])));
    h.source.on("player/p1", Reply::Json(json!({"FirstName": "Ana", "Stats": {}})));

    fetch_league(&h.ctx).await.expect("league");

    assert_eq!(
        h.store.get_object("nouns", "nouns").await.expect("nouns"),
        Some(json!(["Pies", "Dough"]))
    );
    assert_eq!(
        h.store.get_object("adjectives", "adjectives").await.expect("adjectives"),
        Some(json!(["Flaky"]))
    );
    assert_eq!(h.source.calls_to("player/p1"), 1);
    assert_eq!(h.store.get_all_ids("team").await.expect("ids"), vec!["t1"]);
}

#[tokio::test]
async fn backfill_fetches_each_id_once_and_tolerates_unknown_games() {
    let h = harness().await;
    h.source.on("game/6807020ace5a952465d7c1af", Reply::Json(game("Complete")));
    h.source.on("game/680e477a2a8ab3b2a4f3a0a1", Reply::NotFound);

    let text = "6807020ace5a952465d7c1af\nhttps://mmolb.com/watch/680e477a2a8ab3b2a4f3a0a1\n6807020ace5a952465d7c1af\n";
    let summary = backfill_game_ids(&h.ctx, text).await.expect("backfill");
    assert_eq!(summary.found, 1);
    assert_eq!(summary.missing, 1);
    assert_eq!(h.source.calls().len(), 2);
    assert_eq!(games_on_day(&h.store, 3, 40).await.expect("games").len(), 1);
}

#[tokio::test]
async fn failing_iteration_is_contained() {
    let h = harness().await;
    // No scripted election reply, so the job errors.
    assert!(!run_iteration(&h.ctx, Job::FetchElection).await);

    h.source.on("election", Reply::Json(json!({"Open": true})));
    assert!(run_iteration(&h.ctx, Job::FetchElection).await);
    assert!(h.store.get_object("election", "election").await.expect("get").is_some());
}
