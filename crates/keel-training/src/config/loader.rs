//! Reading config files with `_base_` inheritance.
//!
//! A file may list parent files under `_base_` (a string or an array of
//! strings, resolved relative to the including file). Parents are merged in
//! order, then the including file is merged on top. A table that sets
//! `_delete_ = true` replaces the inherited table instead of merging into it.

use crate::error::{LaunchError, LaunchResult};
use std::path::{Path, PathBuf};
use toml::{Table, Value};

pub const BASE_KEY: &str = "_base_";
pub const DELETE_KEY: &str = "_delete_";

/// Load a config file and everything it inherits into one raw table.
pub fn load_table(path: &Path) -> LaunchResult<Table> {
    let mut chain = Vec::new();
    load_recursive(path, &mut chain)
}

fn load_recursive(path: &Path, chain: &mut Vec<PathBuf>) -> LaunchResult<Table> {
    let canonical = path
        .canonicalize()
        .map_err(|e| LaunchError::config(format!("cannot read config {}: {e}", path.display())))?;
    if chain.contains(&canonical) {
        return Err(LaunchError::config(format!(
            "cyclic _base_ inheritance through {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&canonical)
        .map_err(|e| LaunchError::config(format!("cannot read config {}: {e}", path.display())))?;
    let mut table: Table = toml::from_str(&content)
        .map_err(|e| LaunchError::config(format!("failed to parse {}: {e}", path.display())))?;

    let bases = match table.remove(BASE_KEY) {
        None => Vec::new(),
        Some(Value::String(base)) => vec![base],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(LaunchError::config(format!(
                    "{}: _base_ entries must be strings, found {}",
                    path.display(),
                    other.type_str()
                ))),
            })
            .collect::<LaunchResult<_>>()?,
        Some(other) => {
            return Err(LaunchError::config(format!(
                "{}: _base_ must be a string or array, found {}",
                path.display(),
                other.type_str()
            )));
        }
    };

    if bases.is_empty() {
        strip_delete_markers(&mut table);
        return Ok(table);
    }

    let dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
    chain.push(canonical);
    let mut merged = Table::new();
    for base in bases {
        let parent = load_recursive(&dir.join(base), chain)?;
        merge_tables(&mut merged, parent);
    }
    chain.pop();

    merge_tables(&mut merged, table);
    Ok(merged)
}

/// Deep-merge `overlay` into `base`. Tables merge key by key; every other
/// value (arrays included) replaces what was there.
pub fn merge_tables(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match value {
            Value::Table(mut incoming) => {
                let replace = matches!(incoming.remove(DELETE_KEY), Some(Value::Boolean(true)));
                match base.get_mut(&key) {
                    Some(Value::Table(existing)) if !replace => merge_tables(existing, incoming),
                    _ => {
                        strip_delete_markers(&mut incoming);
                        base.insert(key, Value::Table(incoming));
                    }
                }
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}

fn strip_delete_markers(table: &mut Table) {
    table.remove(DELETE_KEY);
    for (_, value) in table.iter_mut() {
        if let Value::Table(inner) = value {
            strip_delete_markers(inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_plain_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plain.toml");
        std::fs::write(&path, "log_level = \"DEBUG\"\n[model]\ntype = \"DBNet\"\n").unwrap();

        let table = load_table(&path).unwrap();
        assert_eq!(table["log_level"].as_str(), Some("DEBUG"));
        assert_eq!(table["model"]["type"].as_str(), Some("DBNet"));
    }

    #[test]
    fn test_base_inheritance_merges_nested_tables() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("_base_")).unwrap();
        std::fs::write(
            temp.path().join("_base_/runtime.toml"),
            "log_level = \"INFO\"\n[dist_params]\nbackend = \"nccl\"\nport = 29500\n",
        )
        .unwrap();
        std::fs::write(
            temp.path().join("_base_/model.toml"),
            "[model]\ntype = \"DBNet\"\n[model.backbone]\ntype = \"ResNet\"\ndepth = 18\n",
        )
        .unwrap();
        let child = temp.path().join("dbnet.toml");
        std::fs::write(
            &child,
            "_base_ = [\"_base_/runtime.toml\", \"_base_/model.toml\"]\n[model.backbone]\ndepth = 50\n",
        )
        .unwrap();

        let table = load_table(&child).unwrap();
        assert!(!table.contains_key(BASE_KEY));
        assert_eq!(table["log_level"].as_str(), Some("INFO"));
        assert_eq!(table["dist_params"]["port"].as_integer(), Some(29500));
        assert_eq!(table["model"]["backbone"]["type"].as_str(), Some("ResNet"));
        assert_eq!(table["model"]["backbone"]["depth"].as_integer(), Some(50));
    }

    #[test]
    fn test_delete_marker_replaces_inherited_table() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("base.toml"),
            "[optimizer]\ntype = \"SGD\"\nlr = 0.01\nmomentum = 0.9\n",
        )
        .unwrap();
        let child = temp.path().join("child.toml");
        std::fs::write(
            &child,
            "_base_ = \"base.toml\"\n[optimizer]\n_delete_ = true\ntype = \"Adam\"\nlr = 0.001\n",
        )
        .unwrap();

        let table = load_table(&child).unwrap();
        let optimizer = table["optimizer"].as_table().unwrap();
        assert_eq!(optimizer["type"].as_str(), Some("Adam"));
        assert!(!optimizer.contains_key("momentum"));
        assert!(!optimizer.contains_key(DELETE_KEY));
    }

    #[test]
    fn test_nested_delete_markers_are_stripped_without_base() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plain.toml");
        std::fs::write(&path, "[model.backbone]\n_delete_ = true\ntype = \"ResNet\"\n").unwrap();

        let table = load_table(&path).unwrap();
        let backbone = table["model"]["backbone"].as_table().unwrap();
        assert_eq!(backbone["type"].as_str(), Some("ResNet"));
        assert!(!backbone.contains_key(DELETE_KEY));
    }

    #[test]
    fn test_cyclic_inheritance_is_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.toml"), "_base_ = \"b.toml\"\n").unwrap();
        std::fs::write(temp.path().join("b.toml"), "_base_ = \"a.toml\"\n").unwrap();

        let err = load_table(&temp.path().join("a.toml")).unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let err = load_table(&temp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, LaunchError::Configuration(_)));
    }
}
