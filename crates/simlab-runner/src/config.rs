use crate::error::{Error, IoContext, Result};
use crate::fsutil::atomic_write_bytes;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

pub const SEED_KEY: &str = "randomSeed";

/// A run's configuration document: a JSON object whose key order is kept
/// exactly as read, so successive rewrites diff cleanly.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    entries: Map<String, Value>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self {
            entries: Map::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).at(path)?;
        Self::parse_file(path, &data)
    }

    /// Parses `data` read from `path`, naming the file in any error.
    pub fn parse_file(path: &Path, data: &str) -> Result<Self> {
        Self::parse(data).map_err(|e| match e {
            Error::Json(source) => Error::precondition(format!(
                "config document {} is not valid JSON: {}",
                path.display(),
                source
            )),
            other => other,
        })
    }

    pub fn parse(data: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(data)? {
            Value::Object(entries) => Ok(Self { entries }),
            other => Err(Error::precondition(format!(
                "config document must be a JSON object, found {}",
                value_type_name(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Replaces the value in place when the key exists, otherwise appends it.
    pub fn set(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn seed(&self) -> Option<i64> {
        self.entries.get(SEED_KEY).and_then(Value::as_i64)
    }

    pub fn set_seed(&mut self, seed: i64) {
        self.set(SEED_KEY, Value::from(seed));
    }

    /// Two-space indented JSON with a trailing newline.
    pub fn render(&self) -> Result<String> {
        let mut out = serde_json::to_string_pretty(&self.entries)?;
        out.push('\n');
        Ok(out)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, self.render()?.as_bytes())
    }
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
