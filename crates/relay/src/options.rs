//! Typed access to a stage's option rows.
//!
//! A stage document carries `options` as a flat list of rows. Each row may
//! name the section it belongs to with a `section` key; rows without one
//! land in [`DEFAULT_SECTION_NAME`]. Rows sharing a section name are
//! collected, in document order, into a [`Section`] of [`Block`]s:
//!
//! ```yaml
//! options:
//!   - section: timer
//!     interval: 1000
//!   - startCount: 5        # -> section "main"
//! ```
//!
//! Every value is passed through [`crate::value::probe`] when the block is
//! built, so `"1000"` is stored as an int and `"true"` as a bool.

use crate::coerce::{self, FromValue};
use crate::error::{RelayError, Result};
use crate::value::{probe, Value};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Section that receives rows without a `section` key.
pub const DEFAULT_SECTION_NAME: &str = "main";

/// Key naming a row's section. Matched case-insensitively.
pub const SECTION_KEY: &str = "section";

/// One raw options row as it appears in a stage document.
pub type OptionRow = serde_json::Map<String, serde_json::Value>;

static EMPTY_BLOCK: Block = Block::empty();

/// Declared type of a configuration key, with the default used when the
/// value is missing or malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    Bool,
    Int,
    Long,
    Number,
    String,
    Date,
    List,
    Map,
    Object,
    Char,
    Text,
}

impl ConfigType {
    pub fn default_value(self) -> Value {
        match self {
            ConfigType::Bool => Value::Bool(false),
            ConfigType::Int => Value::Int(0),
            ConfigType::Long => Value::Long(0),
            ConfigType::Number => Value::Double(0.0),
            ConfigType::String | ConfigType::Date | ConfigType::Text => Value::String(String::new()),
            ConfigType::List => Value::List(Vec::new()),
            ConfigType::Map => Value::Map(BTreeMap::new()),
            ConfigType::Object => Value::Null,
            ConfigType::Char => Value::String(" ".to_string()),
        }
    }

    /// Coerces `value` to this type, or returns `default` when it can't.
    fn coerce(self, value: Option<&Value>, default: Value) -> Value {
        let Some(value) = value else {
            return default;
        };
        let coerced = match self {
            ConfigType::Bool => coerce::as_bool(value).map(Value::Bool),
            ConfigType::Int => coerce::as_int(value).map(Value::Int),
            ConfigType::Long => coerce::as_long(value).map(Value::Long),
            ConfigType::Number => coerce::as_double(value).map(Value::Double),
            ConfigType::String | ConfigType::Date | ConfigType::Text => {
                coerce::as_string(value).map(Value::String)
            }
            ConfigType::Char => coerce::as_char(value).map(|c| Value::String(c.to_string())),
            ConfigType::List => Some(Value::List(coerce::as_list(value))),
            ConfigType::Map => Some(Value::Map(coerce::as_map(value))),
            ConfigType::Object => Some(value.clone()),
        };
        coerced.unwrap_or(default)
    }
}

/// A well-known option key together with its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigKey {
    pub key: &'static str,
    pub ty: ConfigType,
    pub description: &'static str,
}

impl ConfigKey {
    pub const fn new(key: &'static str, ty: ConfigType, description: &'static str) -> Self {
        Self {
            key,
            ty,
            description,
        }
    }

    pub const TIMER: ConfigKey = ConfigKey::new("timer", ConfigType::String, "Timer section");
    pub const INTERVAL: ConfigKey =
        ConfigKey::new("interval", ConfigType::Long, "Interval for periodic events, ms");
    pub const JOIN: ConfigKey = ConfigKey::new("join", ConfigType::String, "Join section");
    pub const TIMEOUT: ConfigKey = ConfigKey::new("timeout", ConfigType::Long, "Timeout, ms");
    pub const MAX_ELEMENTS: ConfigKey =
        ConfigKey::new("maxElements", ConfigType::Int, "Slots required to close a window");
    pub const START_COUNT: ConfigKey =
        ConfigKey::new("startCount", ConfigType::Long, "Initial counter value");
    pub const INCREMENT: ConfigKey =
        ConfigKey::new("increment", ConfigType::Long, "Counter increment");
    pub const REQUEST_LANE: ConfigKey =
        ConfigKey::new("requestLane", ConfigType::String, "Output lane carrying requests");
    pub const RESPONSE_LANE: ConfigKey =
        ConfigKey::new("responseLane", ConfigType::String, "Input lane carrying responses");
    pub const STATES: ConfigKey =
        ConfigKey::new("states", ConfigType::List, "State machine states section");
    pub const EVENTS: ConfigKey =
        ConfigKey::new("events", ConfigType::List, "State machine events section");
    pub const TRANSITIONS: ConfigKey =
        ConfigKey::new("transitions", ConfigType::List, "State machine transitions section");
    pub const CONTENT_TYPE: ConfigKey =
        ConfigKey::new("contentType", ConfigType::String, "Content-Type");
}

/// One options row, with values already type-probed. Keys keep document
/// order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    entries: Vec<(String, Value)>,
}

impl Block {
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn new(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Builds a block from a raw row, dropping the section key and null
    /// values.
    pub fn from_row(row: &OptionRow) -> Self {
        let mut entries = Vec::with_capacity(row.len());
        for (key, raw) in row {
            if key.eq_ignore_ascii_case(SECTION_KEY) {
                continue;
            }
            let (ty, value) = probe(&Value::from(raw.clone()));
            trace!(key = %key, ty = ?ty, "probed option");
            if !value.is_null() {
                entries.push((key.clone(), value));
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// True when `key` holds exactly `value`.
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        self.get(key) == Some(value)
    }

    /// Coerces the value under `key`, if present and convertible.
    pub fn get_as<T: FromValue>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(T::from_value)
    }

    /// Coerces the value under `key`, falling back to `default` when it is
    /// missing or malformed. Never fails.
    pub fn get_or<T: FromValue>(&self, key: &str, default: T) -> T {
        self.get_as(key).unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_as(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        self.get_as(key)
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.get_as(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_as(key)
    }

    /// Reads a well-known key, using its type's default on absence.
    pub fn get_typed(&self, key: &ConfigKey) -> Value {
        key.ty.coerce(self.get(key.key), key.ty.default_value())
    }

    /// Reads a well-known key with an explicit default.
    pub fn get_typed_or(&self, key: &ConfigKey, default: Value) -> Value {
        key.ty.coerce(self.get(key.key), default)
    }

    /// Deserializes the whole block into `T`.
    pub fn transform_to<T: DeserializeOwned>(&self) -> Result<T> {
        let object: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Ok(serde_json::from_value(serde_json::Value::Object(object))?)
    }

    pub fn as_string_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

/// A named, ordered group of blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: String,
    pub blocks: Vec<Block>,
}

impl Default for Section {
    fn default() -> Self {
        Self {
            name: DEFAULT_SECTION_NAME.to_string(),
            blocks: Vec::new(),
        }
    }
}

impl Section {
    pub fn new(name: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            name: name.into(),
            blocks,
        }
    }

    /// First block, or an empty one.
    pub fn block(&self) -> &Block {
        self.block_at(0)
    }

    /// Block at `index`, or an empty one when out of range.
    pub fn block_at(&self, index: usize) -> &Block {
        self.blocks.get(index).unwrap_or(&EMPTY_BLOCK)
    }

    /// First block where `key` holds `value`, or an empty one.
    pub fn find_block(&self, key: &str, value: &Value) -> &Block {
        self.blocks
            .iter()
            .find(|b| b.matches(key, value))
            .unwrap_or(&EMPTY_BLOCK)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Option rows grouped into sections.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageOptions {
    sections: Vec<Section>,
    missing: Section,
}

impl StageOptions {
    /// Groups raw rows into sections.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AmbiguousSection`] when one row names two
    /// distinct sections (e.g. both `section` and `Section` keys).
    pub fn new(rows: &[OptionRow]) -> Result<Self> {
        let mut sections: Vec<Section> = Vec::new();
        for row in rows {
            let name = section_name(row)?;
            let block = Block::from_row(row);
            match sections.iter_mut().find(|s| s.name == name) {
                Some(section) => section.blocks.push(block),
                None => sections.push(Section::new(name, vec![block])),
            }
        }
        Ok(Self {
            sections,
            missing: Section::default(),
        })
    }

    /// Looks a section up by name (case-insensitive). A missing section is
    /// logged and returned as an empty one.
    pub fn section(&self, name: &str) -> &Section {
        let wanted = name.to_lowercase();
        match self.sections.iter().find(|s| s.name == wanted) {
            Some(section) => section,
            None => {
                warn!(section = %name, "section not found");
                &self.missing
            }
        }
    }

    pub fn section_for(&self, key: &ConfigKey) -> &Section {
        self.section(key.key)
    }

    pub fn has_section(&self, name: &str) -> bool {
        let wanted = name.to_lowercase();
        self.sections.iter().any(|s| s.name == wanted)
    }

    pub fn first_section(&self) -> &Section {
        self.sections.first().unwrap_or(&self.missing)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }
}

fn section_name(row: &OptionRow) -> Result<String> {
    let mut names: Vec<String> = Vec::new();
    for (key, value) in row {
        if !key.eq_ignore_ascii_case(SECTION_KEY) {
            continue;
        }
        let name = match value {
            serde_json::Value::Null => DEFAULT_SECTION_NAME.to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !names.contains(&name) {
            names.push(name);
        }
    }
    match names.len() {
        0 => Ok(DEFAULT_SECTION_NAME.to_string()),
        1 => Ok(names.remove(0).to_lowercase()),
        _ => Err(RelayError::AmbiguousSection { names }),
    }
}
