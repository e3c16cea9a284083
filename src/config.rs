//! Store configuration.
//!
//! A store is described by a `type` (`memory`, `filesystem`, `database` or
//! the name of a custom factory), its backend settings and an optional
//! `cache` block:
//!
//! ```toml
//! type = "filesystem"
//! root = "/var/data, ./data"
//! changeDebounce = "500ms"
//!
//! [cache]
//! maxMemSize = "10MB"
//! ```
//!
//! Byte sizes are integers or strings like `100KB` (1024 based). Durations
//! are integers (milliseconds) or strings like `250ms`, `10s` or `1h20m`.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{CacheConfig, DEFAULT_MAX_MEM_ITEM_FRACTION};
use crate::changes::DEFAULT_CHANGE_DEBOUNCE;
use crate::error::{Result, StoreError};
use crate::filesystem::FileSystemOptions;
use crate::sqlite::{SqliteOptions, DEFAULT_POLLING_TIME, DEFAULT_POOL_SIZE, DEFAULT_TABLE};
use crate::watch::DEFAULT_MODIFIED_DEBOUNCE;

/// Settings of the memory backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    pub read_delay: Duration,
    pub write_delay: Duration,
    pub change_debounce: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            read_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
            change_debounce: DEFAULT_CHANGE_DEBOUNCE,
        }
    }
}

/// Settings of the filesystem backend.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSystemConfig {
    /// Candidate roots; the first existing one is used.
    pub roots: Vec<PathBuf>,
    pub options: FileSystemOptions,
}

/// Backend part of a [`StoreConfig`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Memory(MemoryConfig),
    FileSystem(FileSystemConfig),
    Database(SqliteOptions),
    /// A type handled by a registered factory, with its raw settings.
    Custom { kind: String, settings: Map<String, Value> },
}

impl BackendConfig {
    /// The `type` name of this backend.
    pub fn kind(&self) -> &str {
        match self {
            BackendConfig::Memory(_) => "memory",
            BackendConfig::FileSystem(_) => "filesystem",
            BackendConfig::Database(_) => "database",
            BackendConfig::Custom { kind, .. } => kind,
        }
    }
}

/// Complete description of one store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub backend: BackendConfig,
    pub cache: Option<CacheConfig>,
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::from_backend(BackendConfig::Memory(MemoryConfig::default()))
    }

    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self::from_backend(BackendConfig::FileSystem(FileSystemConfig {
            roots: vec![root.into()],
            options: FileSystemOptions::default(),
        }))
    }

    pub fn database(url: impl Into<String>) -> Self {
        Self::from_backend(BackendConfig::Database(SqliteOptions::new(url)))
    }

    pub fn from_backend(backend: BackendConfig) -> Self {
        Self { backend, cache: None }
    }

    /// Wrap the store in the cache decorator.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let parsed: toml::Value = toml::from_str(text)?;
        Self::from_value(serde_json::to_value(parsed)?)
    }

    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Build from an already parsed tree.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut settings) = value else {
            return Err(StoreError::config("store configuration must be a table"));
        };
        let kind = match settings.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(other) => return Err(StoreError::config(format!("invalid store type: {other}"))),
            None => return Err(StoreError::config("store configuration has no type")),
        };
        let cache = settings
            .remove("cache")
            .map(CacheSettings::parse)
            .transpose()?;

        let backend = match kind.as_str() {
            "memory" => {
                let raw: MemorySettings = settings_into(settings, &kind)?;
                BackendConfig::Memory(MemoryConfig {
                    read_delay: raw.read_delay.unwrap_or(Duration::ZERO),
                    write_delay: raw.write_delay.unwrap_or(Duration::ZERO),
                    change_debounce: raw.change_debounce.unwrap_or(DEFAULT_CHANGE_DEBOUNCE),
                })
            }
            "filesystem" => {
                let raw: FileSystemSettings = settings_into(settings, &kind)?;
                let roots = raw.root.map(Roots::into_paths).unwrap_or_default();
                if roots.is_empty() {
                    return Err(StoreError::config("filesystem store needs a root"));
                }
                BackendConfig::FileSystem(FileSystemConfig {
                    roots,
                    options: FileSystemOptions {
                        change_debounce: raw.change_debounce.unwrap_or(DEFAULT_CHANGE_DEBOUNCE),
                        modified_debounce: raw.modified_debounce.unwrap_or(DEFAULT_MODIFIED_DEBOUNCE),
                        watch: raw.watch.unwrap_or(true),
                    },
                })
            }
            "database" => {
                let raw: DatabaseSettings = settings_into(settings, &kind)?;
                let url = raw
                    .url
                    .filter(|url| !url.trim().is_empty())
                    .ok_or_else(|| StoreError::config("database store needs a url"))?;
                BackendConfig::Database(SqliteOptions {
                    url,
                    table: raw.table.unwrap_or_else(|| DEFAULT_TABLE.to_string()),
                    section: raw.section.unwrap_or_default(),
                    pool_size: raw.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
                    polling_time: raw.polling_time.unwrap_or(DEFAULT_POLLING_TIME),
                    change_debounce: raw.change_debounce.unwrap_or(DEFAULT_CHANGE_DEBOUNCE),
                })
            }
            _ => BackendConfig::Custom { kind, settings },
        };
        Ok(Self { backend, cache })
    }
}

impl<'de> Deserialize<'de> for StoreConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        StoreConfig::from_value(value).map_err(de::Error::custom)
    }
}

fn settings_into<T: de::DeserializeOwned>(settings: Map<String, Value>, kind: &str) -> Result<T> {
    serde_json::from_value(Value::Object(settings))
        .map_err(|e| StoreError::config(format!("invalid {kind} store configuration: {e}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemorySettings {
    #[serde(default, deserialize_with = "duration_opt")]
    read_delay: Option<Duration>,
    #[serde(default, deserialize_with = "duration_opt")]
    write_delay: Option<Duration>,
    #[serde(default, deserialize_with = "duration_opt")]
    change_debounce: Option<Duration>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Roots {
    One(String),
    Many(Vec<String>),
}

impl Roots {
    fn into_paths(self) -> Vec<PathBuf> {
        let entries: Vec<String> = match self {
            Roots::One(list) => list.split(',').map(str::to_string).collect(),
            Roots::Many(list) => list,
        };
        entries
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileSystemSettings {
    root: Option<Roots>,
    #[serde(default, deserialize_with = "duration_opt")]
    change_debounce: Option<Duration>,
    #[serde(default, deserialize_with = "duration_opt")]
    modified_debounce: Option<Duration>,
    watch: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseSettings {
    url: Option<String>,
    table: Option<String>,
    section: Option<String>,
    pool_size: Option<u32>,
    #[serde(default, deserialize_with = "duration_opt")]
    polling_time: Option<Duration>,
    #[serde(default, deserialize_with = "duration_opt")]
    change_debounce: Option<Duration>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheSettings {
    #[serde(default, deserialize_with = "byte_size_opt")]
    max_mem_size: Option<u64>,
    max_mem_item_fraction: Option<f64>,
    read_only_on_store_fail: Option<bool>,
}

impl CacheSettings {
    fn parse(value: Value) -> Result<CacheConfig> {
        let raw: CacheSettings = serde_json::from_value(value)
            .map_err(|e| StoreError::config(format!("invalid cache configuration: {e}")))?;
        let max_mem_size = raw
            .max_mem_size
            .ok_or_else(|| StoreError::config("cache configuration needs maxMemSize"))?;
        let config = CacheConfig {
            max_mem_size,
            max_mem_item_fraction: raw
                .max_mem_item_fraction
                .unwrap_or(DEFAULT_MAX_MEM_ITEM_FRACTION),
            read_only_on_store_fail: raw.read_only_on_store_fail.unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

fn duration_opt<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error> {
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(millis)) => Ok(Some(Duration::from_millis(millis))),
        Some(NumberOrText::Text(text)) => parse_duration(&text).map(Some).map_err(de::Error::custom),
    }
}

fn byte_size_opt<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u64>, D::Error> {
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(bytes)) => Ok(Some(bytes)),
        Some(NumberOrText::Text(text)) => parse_byte_size(&text).map(Some).map_err(de::Error::custom),
    }
}

/// Parse a byte size such as `512`, `100KB`, `1.5 MB` or `2GB` (1024 based).
pub fn parse_byte_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| StoreError::config(format!("invalid byte size: {text:?}")))?;
    let factor: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        _ => return Err(StoreError::config(format!("invalid byte size unit: {text:?}"))),
    };
    Ok((number * factor as f64) as u64)
}

/// Parse a duration such as `250ms`, `2.5s`, `1h20m`, `1 week 2 days` or a
/// plain number of milliseconds.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let invalid = || StoreError::config(format!("invalid duration: {text:?}"));
    if text.is_empty() {
        return Err(invalid());
    }
    if text.chars().all(|c| c.is_ascii_digit()) {
        return text.parse().map(Duration::from_millis).map_err(|_| invalid());
    }

    let mut nanos = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let amount: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = rest[number_len..].trim_start();
        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let factor = match rest[..unit_len].to_ascii_lowercase().as_str() {
            "ns" | "nano" | "nanos" => 1.0,
            "us" | "micro" | "micros" => 1e3,
            "ms" | "milli" | "millis" => 1e6,
            "s" | "sec" | "secs" | "second" | "seconds" => 1e9,
            "m" | "min" | "mins" | "minute" | "minutes" => 60e9,
            "h" | "hour" | "hours" => 3600e9,
            "d" | "day" | "days" => 86_400e9,
            "w" | "week" | "weeks" => 604_800e9,
            _ => return Err(invalid()),
        };
        nanos += amount * factor;
        rest = rest[unit_len..].trim_start();
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("512").unwrap(), 512);
        assert_eq!(parse_byte_size("100B").unwrap(), 100);
        assert_eq!(parse_byte_size("100KB").unwrap(), 100 * 1024);
        assert_eq!(parse_byte_size("10 mb").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_byte_size("1.5MB").unwrap(), 1536 * 1024);
        assert_eq!(parse_byte_size("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_byte_size("lots").is_err());
        assert!(parse_byte_size("10XB").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h20m").unwrap(), Duration::from_secs(4800));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("2s150ms").unwrap(), Duration::from_millis(2150));
        assert_eq!(parse_duration("2.17s5ms").unwrap(), Duration::from_millis(2175));
        assert_eq!(parse_duration("123min").unwrap(), Duration::from_secs(123 * 60));
        assert_eq!(
            parse_duration("1 week 2 days 1 minute").unwrap(),
            Duration::from_secs(9 * 86_400 + 60)
        );
        assert!(parse_duration("").is_err());
        assert!(parse_duration("nonsense").is_err());
        assert!(parse_duration("3h2illegals").is_err());
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_memory_from_toml() {
        let config = StoreConfig::from_toml(
            r#"
            type = "memory"
            readDelay = "50ms"
            changeDebounce = 0
            "#,
        )
        .unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Memory(MemoryConfig {
                read_delay: Duration::from_millis(50),
                write_delay: Duration::ZERO,
                change_debounce: Duration::ZERO,
            })
        );
        assert!(config.cache.is_none());
    }

    #[test]
    fn test_filesystem_roots() {
        let single = StoreConfig::from_json(r#"{"type":"filesystem","root":"/a, /b"}"#).unwrap();
        let list = StoreConfig::from_json(r#"{"type":"filesystem","root":["/a","/b"]}"#).unwrap();
        assert_eq!(single, list);
        match single.backend {
            BackendConfig::FileSystem(fs) => {
                assert_eq!(fs.roots, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
                assert_eq!(fs.options.modified_debounce, DEFAULT_MODIFIED_DEBOUNCE);
            }
            other => panic!("unexpected backend {other:?}"),
        }
        assert!(StoreConfig::from_json(r#"{"type":"filesystem"}"#).is_err());
    }

    #[test]
    fn test_database_defaults() {
        let config = StoreConfig::from_toml(
            r#"
            type = "database"
            url = "sqlite::memory:"
            pollingTime = "1h20m"
            "#,
        )
        .unwrap();
        match config.backend {
            BackendConfig::Database(options) => {
                assert_eq!(options.table, DEFAULT_TABLE);
                assert_eq!(options.section, "");
                assert_eq!(options.pool_size, DEFAULT_POOL_SIZE);
                assert_eq!(options.polling_time, Duration::from_secs(4800));
            }
            other => panic!("unexpected backend {other:?}"),
        }
        let missing = StoreConfig::from_toml("type = \"database\"");
        assert!(matches!(missing, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_cache_block() {
        let config = StoreConfig::from_toml(
            r#"
            type = "memory"
            [cache]
            maxMemSize = "100KB"
            readOnlyOnStoreFail = false
            "#,
        )
        .unwrap();
        let cache = config.cache.unwrap();
        assert_eq!(cache.max_mem_size, 100 * 1024);
        assert_eq!(cache.max_mem_item_fraction, DEFAULT_MAX_MEM_ITEM_FRACTION);
        assert!(!cache.read_only_on_store_fail);
    }

    #[test]
    fn test_cache_without_max_size_fails() {
        let result = StoreConfig::from_json(r#"{"type":"memory","cache":{"maxMemItemFraction":0.2}}"#);
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_cache_invalid_fraction_fails() {
        let result = StoreConfig::from_json(
            r#"{"type":"memory","cache":{"maxMemSize":"1MB","maxMemItemFraction":2}}"#,
        );
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_custom_type_keeps_settings() {
        let config = StoreConfig::from_json(r#"{"type":"s3","bucket":"b1"}"#).unwrap();
        assert_eq!(config.backend.kind(), "s3");
        match config.backend {
            BackendConfig::Custom { settings, .. } => {
                assert_eq!(settings.get("bucket"), Some(&Value::from("b1")));
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_deserialize_embedded() {
        #[derive(Deserialize)]
        struct App {
            store: StoreConfig,
        }
        let app: App = toml::from_str("[store]\ntype = \"memory\"\n").unwrap();
        assert_eq!(app.store, StoreConfig::memory());
    }
}
