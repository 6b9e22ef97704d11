//! Core domain model, canonical hashing and payload codec for Cashews.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "cashews-core";

/// Entity type names as they appear in the `type` column of the store.
pub mod kind {
    pub const STATE: &str = "state";
    pub const TIME: &str = "time";
    pub const LEAGUE: &str = "league";
    pub const TEAM: &str = "team";
    pub const PLAYER: &str = "player";
    pub const GAME: &str = "game";
    pub const GAME_BY_TEAM: &str = "game-by-team";
    pub const NEWS: &str = "news";
    pub const SPOTLIGHT: &str = "spotlight";
    pub const ELECTION: &str = "election";
    pub const NOUNS: &str = "nouns";
    pub const ADJECTIVES: &str = "adjectives";
}

pub const PLAYER_CACHE_INTERVAL_MS: i64 = 90 * 60 * 1000;
pub const TEAM_CACHE_INTERVAL_MS: i64 = 5 * 60 * 1000;
pub const LEAGUE_CACHE_INTERVAL_MS: i64 = 30 * 1000;
pub const STATE_CACHE_INTERVAL_MS: i64 = 10 * 1000;
pub const TIME_CACHE_INTERVAL_MS: i64 = 1000;
pub const GAME_CACHE_INTERVAL_MS: i64 = 5 * 60 * 1000;
pub const GAME_BY_TEAM_CACHE_INTERVAL_MS: i64 = 10 * 60 * 1000;

const ZSTD_LEVEL: i32 = 3;
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Hex-encoded SHA-256 of a payload's canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in log lines, e.g. `3f2a9c01..`.
    pub fn abbrev(&self) -> String {
        let end = self.0.len().min(8);
        format!("{}..", &self.0[..end])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One fetch (or direct save) that produced a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub entity_type: String,
    pub entity_id: String,
    pub timestamp: i64,
    pub hash: ContentHash,
}

/// Latest-known version of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub hash: ContentHash,
    pub last_update: i64,
}

/// A current entity joined with its payload, as returned by `get_all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub data: JsonValue,
    pub last_update: i64,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Deterministic encoding with object keys sorted bytewise at every depth.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, inner)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(inner, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, inner) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(inner, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn content_hash(value: &JsonValue) -> ContentHash {
    ContentHash(sha256_hex(canonical_json(value).as_bytes()))
}

/// Canonical bytes, zstd-compressed for the `objects.data` column.
pub fn encode_payload(value: &JsonValue) -> Result<Vec<u8>, CodecError> {
    let canonical = canonical_json(value);
    Ok(zstd::encode_all(canonical.as_bytes(), ZSTD_LEVEL)?)
}

/// Reverses [`encode_payload`]. Uncompressed JSON text is accepted as-is.
pub fn decode_payload(bytes: &[u8]) -> Result<JsonValue, CodecError> {
    if bytes.starts_with(&ZSTD_MAGIC) {
        let raw = zstd::decode_all(bytes)?;
        Ok(serde_json::from_slice(&raw)?)
    } else {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_millis()
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Creation time encoded in the leading 8 hex digits of an object id.
pub fn id_timestamp_ms(id: &str) -> Option<i64> {
    let prefix = id.get(..8)?;
    i64::from_str_radix(prefix, 16).ok().map(|secs| secs * 1000)
}

pub fn is_object_id(token: &str) -> bool {
    token.len() == 24 && token.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Every distinct 24-hex-digit id in `text`, in order of first appearance.
pub fn scan_object_ids(text: &str) -> Vec<String> {
    let mut seen = Vec::<String>::new();
    for token in text.split(|c: char| !c.is_ascii_alphanumeric()) {
        if is_object_id(token) && !seen.iter().any(|s| s == token) {
            seen.push(token.to_string());
        }
    }
    seen
}

fn str_field<'a>(value: &'a JsonValue, key: &str) -> &'a str {
    value.get(key).and_then(JsonValue::as_str).unwrap_or_default()
}

pub fn player_name(player: &JsonValue) -> String {
    format!("{} {}", str_field(player, "FirstName"), str_field(player, "LastName"))
}

pub fn team_name(team: &JsonValue) -> String {
    format!("{} {}", str_field(team, "Location"), str_field(team, "Name"))
}

/// Player ids on a team roster. `Players` may be a list or a map keyed by slot;
/// placeholder ids containing `#` are dropped.
pub fn team_player_ids(team: &JsonValue) -> Vec<String> {
    let entries: Vec<&JsonValue> = match team.get("Players") {
        Some(JsonValue::Array(items)) => items.iter().collect(),
        Some(JsonValue::Object(map)) => map.values().collect(),
        _ => Vec::new(),
    };
    entries
        .into_iter()
        .filter_map(|p| p.get("PlayerID").and_then(JsonValue::as_str))
        .filter(|id| !id.contains('#'))
        .map(str::to_string)
        .collect()
}

/// League roster plus its superstar team, when it has one.
pub fn league_team_ids(league: &JsonValue) -> Vec<String> {
    let mut ids: Vec<String> = league
        .get("Teams")
        .and_then(JsonValue::as_array)
        .map(|teams| {
            teams
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if let Some(superstar) = league.get("SuperstarTeam").and_then(JsonValue::as_str) {
        if !superstar.is_empty() {
            ids.push(superstar.to_string());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_form_ignores_key_order() {
        let a: JsonValue = serde_json::from_str(r#"{"b":1,"a":{"y":[1,2],"x":null}}"#).unwrap();
        let b: JsonValue = serde_json::from_str(r#"{"a":{"x":null,"y":[1,2]},"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn different_payloads_hash_differently() {
        assert_ne!(content_hash(&json!({"a": 1})), content_hash(&json!({"a": 2})));
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(content_hash(&json!({"a": 1})).as_str(), sha256_hex(br#"{"a":1}"#));
    }

    #[test]
    fn codec_restores_payload_and_accepts_plain_text() {
        let value = json!({"Name": "Pickles", "Stats": {"t1": {"hits": 3}}});
        let blob = encode_payload(&value).unwrap();
        assert!(blob.starts_with(&ZSTD_MAGIC));
        assert_eq!(decode_payload(&blob).unwrap(), value);
        assert_eq!(decode_payload(br#"{"a":1}"#).unwrap(), json!({"a": 1}));
        assert!(decode_payload(b"not json").is_err());
    }

    #[test]
    fn abbrev_keeps_eight_chars() {
        let hash = ContentHash::from_hex("0123456789abcdef");
        assert_eq!(hash.abbrev(), "01234567..");
    }

    #[test]
    fn roster_ids_from_list_or_map() {
        let list = json!({"Players": [{"PlayerID": "a"}, {"PlayerID": "#slot"}, {"PlayerID": "b"}]});
        let map = json!({"Players": {"C": {"PlayerID": "a"}}});
        assert_eq!(team_player_ids(&list), vec!["a", "b"]);
        assert_eq!(team_player_ids(&map), vec!["a"]);
        assert!(team_player_ids(&json!({})).is_empty());
    }

    #[test]
    fn league_team_ids_include_superstar() {
        let league = json!({"Teams": ["t1", "t2"], "SuperstarTeam": "s"});
        assert_eq!(league_team_ids(&league), vec!["t1", "t2", "s"]);
        let no_star = json!({"Teams": ["t1"], "SuperstarTeam": null});
        assert_eq!(league_team_ids(&no_star), vec!["t1"]);
    }

    #[test]
    fn object_ids_are_scanned_once_each() {
        let text = "see 6807020ace5a952465d7c1af and https://mmolb.com/watch/680e477a2a8ab3b2a4f3a0a1, again 6807020ace5a952465d7c1af; not 6807020ACE5A952465D7C1AF";
        assert_eq!(
            scan_object_ids(text),
            vec!["6807020ace5a952465d7c1af", "680e477a2a8ab3b2a4f3a0a1"]
        );
        assert_eq!(id_timestamp_ms("6807020ace5a952465d7c1af"), Some(0x6807020a * 1000));
        assert_eq!(id_timestamp_ms("xyz"), None);
    }
}
