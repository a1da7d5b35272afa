//! Record data structures.
//!
//! A [`Record`] is the unit stored in the primary store: a key, an opaque
//! JSON [`Document`], and creation/update timestamps. Player records are
//! addressed by [`PlayerKey`]; shared catalog records by a
//! [`CollectionKind`] plus a record id.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Opaque document body: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A stored document with metadata.
///
/// # Example
///
/// ```
/// use state_engine::Record;
/// use serde_json::json;
///
/// let mut record = Record::new("42", json!({"points": 0, "energy": 1000}).as_object().unwrap().clone());
/// let patch = json!({"points": 150});
/// record.apply_patch(patch.as_object().unwrap());
///
/// assert_eq!(record.data["points"], 150);
/// assert_eq!(record.data["energy"], 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub key: String,
    pub data: Document,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Record {
    pub fn new(key: impl Into<String>, data: Document) -> Self {
        let now = now_millis();
        Self {
            key: key.into(),
            data,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow-merge `patch` onto the document and stamp `updated_at`.
    pub fn apply_patch(&mut self, patch: &Document) {
        merge_patch(&mut self.data, patch);
        self.touch();
    }

    /// Stamp `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
    }
}

/// Top-level merge: patch fields overwrite, absent fields are untouched,
/// nested arrays and objects are replaced wholesale.
pub fn merge_patch(target: &mut Document, patch: &Document) {
    for (field, value) in patch {
        target.insert(field.clone(), value.clone());
    }
}

/// Validate a caller-supplied patch and unwrap it into a [`Document`].
pub fn patch_from_value(patch: Value) -> Result<Document> {
    match patch {
        Value::Object(map) if map.is_empty() => {
            Err(EngineError::Validation("patch must not be empty".into()))
        }
        Value::Object(map) => Ok(map),
        other => Err(EngineError::Validation(format!(
            "patch must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check that an id is safe to embed in a file name.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(EngineError::Validation(format!("{kind} must not be empty")));
    }
    if id.len() > 128 {
        return Err(EngineError::Validation(format!("{kind} is longer than 128 bytes")));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(EngineError::Validation(format!(
            "{kind} '{id}' contains characters outside [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

/// Identity of a player record.
///
/// The file path is derived deterministically from `(telegram_id, username)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlayerKey {
    telegram_id: String,
    username: Option<String>,
}

impl PlayerKey {
    pub fn new(telegram_id: impl Into<String>) -> Self {
        Self {
            telegram_id: telegram_id.into(),
            username: None,
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        let cleaned = sanitize_username(&username.into());
        self.username = (!cleaned.is_empty()).then_some(cleaned);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_id("telegram id", &self.telegram_id)
    }

    /// Row id used by the secondary store.
    #[must_use]
    pub fn record_id(&self) -> &str {
        &self.telegram_id
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Path relative to the data directory.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        let file = match &self.username {
            Some(name) => format!("{}_{}.json", name, self.telegram_id),
            None => format!("{}.json", self.telegram_id),
        };
        PathBuf::from(PLAYERS_DIR).join(file)
    }
}

impl fmt::Display for PlayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(name) => write!(f, "{}@{}", self.telegram_id, name),
            None => write!(f, "{}", self.telegram_id),
        }
    }
}

pub(crate) const PLAYERS_DIR: &str = "players";

fn sanitize_username(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('@')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect()
}

/// How a collection is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionLayout {
    /// One file `<collection>.json` holding every record keyed by id
    Aggregate,
    /// One file per record at `<collection>/<id>.json`
    PerRecord,
}

/// Shared catalog collections edited by administrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Upgrades,
    Characters,
    Levels,
    Tasks,
    Achievements,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 5] = [
        Self::Upgrades,
        Self::Characters,
        Self::Levels,
        Self::Tasks,
        Self::Achievements,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upgrades => "upgrades",
            Self::Characters => "characters",
            Self::Levels => "levels",
            Self::Tasks => "tasks",
            Self::Achievements => "achievements",
        }
    }

    #[must_use]
    pub fn layout(&self) -> CollectionLayout {
        match self {
            Self::Upgrades | Self::Levels => CollectionLayout::Aggregate,
            Self::Characters | Self::Tasks | Self::Achievements => CollectionLayout::PerRecord,
        }
    }

    /// File holding record `id`, relative to the data directory.
    #[must_use]
    pub fn relative_path(&self, id: &str) -> PathBuf {
        match self.layout() {
            CollectionLayout::Aggregate => PathBuf::from(format!("{}.json", self.as_str())),
            CollectionLayout::PerRecord => PathBuf::from(self.as_str()).join(format!("{id}.json")),
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity type replicated to the secondary store; names a sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    PlayerState,
    Upgrades,
    Characters,
    Levels,
    Tasks,
    Achievements,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        Self::PlayerState,
        Self::Upgrades,
        Self::Characters,
        Self::Levels,
        Self::Tasks,
        Self::Achievements,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlayerState => "player_state",
            Self::Upgrades => "upgrades",
            Self::Characters => "characters",
            Self::Levels => "levels",
            Self::Tasks => "tasks",
            Self::Achievements => "achievements",
        }
    }

    #[must_use]
    pub fn is_catalog(&self) -> bool {
        !matches!(self, Self::PlayerState)
    }

    /// Position in [`EntityKind::ALL`]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl From<CollectionKind> for EntityKind {
    fn from(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Upgrades => Self::Upgrades,
            CollectionKind::Characters => Self::Characters,
            CollectionKind::Levels => Self::Levels,
            CollectionKind::Tasks => Self::Tasks,
            CollectionKind::Achievements => Self::Achievements,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
