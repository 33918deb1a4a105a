//! Config file discovery, table merging, and environment variable overlay.

use crate::ConfigError;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides (`SA_<SECTION>_<FIELD>`).
pub const DEFAULT_ENV_PREFIX: &str = "SA";

/// Directory name used under `/etc` and the user config dir.
const APP_DIR: &str = "smart-assistant";

/// Local override file name, looked up in the current directory.
const LOCAL_FILE: &str = "smart-assistant.toml";

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided it replaces the local override. A CLI path that
/// does not exist is still returned so loading reports it instead of
/// silently falling back to defaults.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc").join(APP_DIR).join("config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user = config_dir.join(APP_DIR).join("config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from(LOCAL_FILE);
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_from_file(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse a TOML document into a raw table.
pub fn parse_toml(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse::<toml::Table>()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base` key by key; nested tables merge recursively.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply `<PREFIX>_<SECTION>_<FIELD>=value` variables onto a raw table.
///
/// The section is the text before the first underscore, the field is the
/// rest, both lowercased. Returns the names of the variables applied.
pub fn apply_env_overrides<I>(table: &mut toml::Table, prefix: &str, vars: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let marker = format!("{}_", prefix);
    let mut applied = Vec::new();

    for (key, value) in vars {
        let Some(rest) = key.strip_prefix(&marker) else {
            continue;
        };
        let rest = rest.to_lowercase();
        let Some((section, field)) = rest.split_once('_') else {
            continue;
        };
        if section.is_empty() || field.is_empty() {
            continue;
        }

        let entry = table
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if !entry.is_table() {
            *entry = toml::Value::Table(toml::Table::new());
        }
        if let toml::Value::Table(section_table) = entry {
            section_table.insert(field.to_string(), env_value(&value));
            applied.push(key);
        }
    }

    applied.sort();
    applied
}

/// Convert an environment string into a TOML value.
///
/// All-digit strings become integers, `true`/`false` become booleans,
/// everything else stays a string.
fn env_value(raw: &str) -> toml::Value {
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = raw.parse::<i64>() {
            return toml::Value::Integer(n);
        }
    }
    match raw.to_lowercase().as_str() {
        "true" => toml::Value::Boolean(true),
        "false" => toml::Value::Boolean(false),
        _ => toml::Value::String(raw.to_string()),
    }
}
