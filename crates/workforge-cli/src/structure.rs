//! Project structure files.
//!
//! JSON uses `null` for files and objects for directories. TOML has no null,
//! so any non-table value marks a file there (`"add.py" = ""`).

use serde_json::Value;
use std::path::Path;
use workforge_core::{WorkforgeError, WorkforgeResult};

pub fn load_structure(path: &Path) -> WorkforgeResult<Value> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        WorkforgeError::Config(format!("Failed to read structure '{}': {e}", path.display()))
    })?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        let table: toml::Table = toml::from_str(&raw).map_err(|e| {
            WorkforgeError::Config(format!("Failed to parse structure '{}': {e}", path.display()))
        })?;
        Ok(from_toml_table(table))
    } else {
        Ok(serde_json::from_str(&raw)?)
    }
}

fn from_toml_table(table: toml::Table) -> Value {
    Value::Object(
        table
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    toml::Value::Table(children) => from_toml_table(children),
                    _ => Value::Null,
                };
                (name, value)
            })
            .collect(),
    )
}
