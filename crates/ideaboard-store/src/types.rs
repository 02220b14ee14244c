//! Core types for idea records.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::RecordRef;

/// Global counter for TID clock identifier to ensure uniqueness within a process.
static TID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A TID (timestamp-based ID) used as record keys by in-process stores.
///
/// 13 characters of base32-sortable encoding: 53 bits of microsecond
/// timestamp followed by 10 bits of clock identifier. Lexical order of TIDs
/// matches creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(String);

impl Tid {
    /// Generate a new TID based on current time with a unique clock identifier.
    pub fn now() -> Self {
        let micros = Utc::now().timestamp_micros().max(0) as u64;

        // Counter wraps at 1024 (10 bits).
        let clock_id = TID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0x3FF;

        Self::from_u64((micros << 10) | clock_id)
    }

    fn from_u64(val: u64) -> Self {
        const CHARSET: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

        let mut chars = [0u8; 13];
        let mut v = val;
        for slot in chars.iter_mut().rev() {
            *slot = CHARSET[(v & 0x1f) as usize];
            v >>= 5;
        }

        Self(chars.iter().map(|&c| c as char).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-assigned logical identifier of an idea.
///
/// Stable for the lifetime of the idea and embedded in the record body as
/// `id`. Distinct from the store's [`RecordRef`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdeaId(String);

impl IdeaId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for IdeaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IdeaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for IdeaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The signed-in user as reported by an identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    /// Account DID.
    pub did: String,
    /// Account handle.
    pub handle: String,
    /// Profile display name, if one is set.
    pub display_name: Option<String>,
    /// URL of the profile picture, if one is set.
    pub photo_url: Option<String>,
}

/// A shared idea on the board.
///
/// Author fields are a snapshot of the user at creation time and are not
/// refreshed if the profile changes later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Idea {
    pub id: IdeaId,
    pub title: String,
    pub description: String,
    pub tags: BTreeSet<String>,
    pub votes: i64,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

impl Idea {
    /// Create a new idea authored by `author`, with a fresh id, zero votes
    /// and the current time.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        tags: impl IntoIterator<Item = String>,
        author: &CurrentUser,
    ) -> Self {
        Self {
            id: IdeaId::generate(),
            title: title.into(),
            description: description.into(),
            tags: tags.into_iter().collect(),
            votes: 0,
            user_id: Some(author.did.clone()),
            display_name: Some(
                author
                    .display_name
                    .clone()
                    .unwrap_or_else(|| author.handle.clone()),
            ),
            photo_url: author.photo_url.clone(),
            date: Some(Utc::now()),
        }
    }

    /// A copy of this idea with one more vote.
    pub fn upvote(&self) -> Self {
        Self {
            votes: self.votes.saturating_add(1),
            ..self.clone()
        }
    }

    /// Project a raw record body into an idea.
    ///
    /// Every field is decoded on its own. Missing or malformed fields take
    /// their empty value instead of failing the whole record.
    pub fn from_record(value: &Value) -> Self {
        let votes = value.get("votes").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        });
        if votes.is_none() && value.get("votes").is_some_and(|v| !v.is_null()) {
            debug!(field = "votes", "malformed idea field, using 0");
        }

        Self {
            id: field(value, "id").unwrap_or_default(),
            title: field(value, "title").unwrap_or_default(),
            description: field(value, "description").unwrap_or_default(),
            tags: field(value, "tags").unwrap_or_default(),
            votes: votes.unwrap_or_default(),
            user_id: field(value, "userId"),
            display_name: field(value, "displayName"),
            photo_url: field(value, "photoURL"),
            date: field(value, "date"),
        }
    }

    /// Record body for this idea, carrying every field.
    pub fn to_record(&self) -> Value {
        json!({
            "id": self.id,
            "title": self.title,
            "description": self.description,
            "tags": self.tags,
            "votes": self.votes,
            "userId": self.user_id,
            "displayName": self.display_name,
            "photoURL": self.photo_url,
            "date": self.date,
        })
    }
}

fn field<T: DeserializeOwned>(value: &Value, name: &'static str) -> Option<T> {
    let raw = value.get(name).filter(|v| !v.is_null())?;
    match T::deserialize(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(field = name, error = %e, "malformed idea field, using empty value");
            None
        }
    }
}

/// A record as held by a store: its handle, content hash and raw body.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub handle: RecordRef,
    pub cid: Option<String>,
    pub value: Value,
}

impl StoredRecord {
    /// The idea id embedded in the record body, if it is a string.
    pub fn idea_id(&self) -> Option<&str> {
        self.value.get("id").and_then(Value::as_str)
    }
}
