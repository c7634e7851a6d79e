//! Configuration types and YAML loading for satfetch
//!
//! The configuration file is a YAML mapping with a `logging` section and a
//! list of `jobs`. Strings may interpolate `${VAR}` from the process
//! environment (a missing variable is fatal). Credentials never live in the
//! config file; a top-level `credentials` key is rejected outright.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Logging configuration (consumed by the embedding application's
/// subscriber setup; the library itself only emits `tracing` events)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level name (default: "INFO")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file path
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Catalog search filter bundle.
///
/// Unset fields are omitted from the upstream query; `sort` always carries
/// a value (default `"start,time,1"`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchFilters {
    /// Sensing window start (ISO-8601; `Z` accepted)
    #[serde(with = "flexible_datetime")]
    pub dtstart: Option<DateTime<Utc>>,

    /// Sensing window end (ISO-8601; `Z` accepted)
    #[serde(with = "flexible_datetime")]
    pub dtend: Option<DateTime<Utc>>,

    /// Geometry as well-known text
    pub geo: Option<String>,

    /// Bounding box `lon_min,lat_min,lon_max,lat_max`
    pub bbox: Option<String>,

    /// Satellite identifier
    pub sat: Option<String>,

    /// Timeliness code
    pub timeliness: Option<String>,

    /// Filename pattern
    pub filename: Option<String>,

    /// Title pattern
    pub title: Option<String>,

    /// Cycle number
    pub cycle: Option<i64>,

    /// Orbit number
    pub orbit: Option<i64>,

    /// Relative orbit number
    pub relorbit: Option<i64>,

    /// Product type identifier
    pub product_type: Option<String>,

    /// Type identifier
    #[serde(rename = "type")]
    pub kind: Option<String>,

    /// Publication identifier
    pub publication: Option<String>,

    /// Download-coverage identifier
    pub download_coverage: Option<String>,

    /// Coverage identifier
    pub coverage: Option<String>,

    /// Repeat-cycle identifier
    pub repeat_cycle_identifier: Option<String>,

    /// Center-of-longitude value
    pub center_of_longitude: Option<String>,

    /// Set identifier
    pub set: Option<String>,

    /// Sort key (default: "start,time,1")
    #[serde(default = "default_sort")]
    pub sort: String,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            dtstart: None,
            dtend: None,
            geo: None,
            bbox: None,
            sat: None,
            timeliness: None,
            filename: None,
            title: None,
            cycle: None,
            orbit: None,
            relorbit: None,
            product_type: None,
            kind: None,
            publication: None,
            download_coverage: None,
            coverage: None,
            repeat_cycle_identifier: None,
            center_of_longitude: None,
            set: None,
            sort: default_sort(),
        }
    }
}

impl SearchFilters {
    /// Query parameters for the catalog search endpoint, dropping exactly
    /// the fields whose value is unset.
    pub fn to_query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();

        if let Some(dt) = self.dtstart {
            params.push(("dtstart", format_query_datetime(dt)));
        }
        if let Some(dt) = self.dtend {
            params.push(("dtend", format_query_datetime(dt)));
        }

        let strings: [(&'static str, &Option<String>); 14] = [
            ("geo", &self.geo),
            ("bbox", &self.bbox),
            ("sat", &self.sat),
            ("timeliness", &self.timeliness),
            ("filename", &self.filename),
            ("title", &self.title),
            ("product_type", &self.product_type),
            ("type", &self.kind),
            ("publication", &self.publication),
            ("download_coverage", &self.download_coverage),
            ("coverage", &self.coverage),
            ("repeat_cycle_identifier", &self.repeat_cycle_identifier),
            ("center_of_longitude", &self.center_of_longitude),
            ("set", &self.set),
        ];
        for (key, value) in strings {
            if let Some(v) = value {
                params.push((key, v.clone()));
            }
        }

        let ints: [(&'static str, &Option<i64>); 3] = [
            ("cycle", &self.cycle),
            ("orbit", &self.orbit),
            ("relorbit", &self.relorbit),
        ];
        for (key, value) in ints {
            if let Some(v) = value {
                params.push((key, v.to_string()));
            }
        }

        params.push(("sort", self.sort.clone()));
        params
    }
}

/// Download options for a job
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadOptions {
    /// Whether to transfer bytes at all; `false` only registers state rows
    pub enabled: bool,

    /// Download directory (informational; the session derives the actual
    /// artifact root from its base directory)
    pub directory: PathBuf,

    /// Maximum concurrent item transfers
    pub parallel: usize,

    /// Resume partial files via byte-range requests
    pub resume: bool,

    /// Verify transferred payloads against the catalog-reported MD5
    pub verify_md5: bool,

    /// Maximum retries per item after the first attempt
    pub max_retries: u32,

    /// Base seconds for exponential retry backoff
    pub retry_backoff: f64,

    /// Per-item transfer deadline in seconds
    pub timeout: f64,

    /// Glob patterns selecting sub-entries; unset = whole product
    pub entries: Option<Vec<String>>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./downloads"),
            parallel: 4,
            resume: true,
            verify_md5: true,
            max_retries: 3,
            retry_backoff: 2.0,
            timeout: 300.0,
            entries: None,
        }
    }
}

impl DownloadOptions {
    /// Per-item transfer deadline
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// Where a post-processing hook runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostProcessMode {
    /// Hook receives the downloaded file path
    #[default]
    Local,
    /// Hook receives a lazy remote view; nothing is downloaded
    Remote,
}

/// Post-processing options for a job
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostProcessOptions {
    /// Whether to run a post-processing hook
    pub enabled: bool,

    /// Hook mode
    pub mode: PostProcessMode,

    /// Output directory passed through to the hook environment
    pub output_dir: PathBuf,
}

impl Default for PostProcessOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: PostProcessMode::Local,
            output_dir: PathBuf::from("./output"),
        }
    }
}

/// Named post-search filter with its parameter bundle
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PostSearchFilterConfig {
    /// Filter type name, or `"namespace:factory"` for registered extensions
    #[serde(rename = "type")]
    pub kind: String,

    /// Parameters forwarded to the filter factory
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Configuration for a single download job
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    /// Job name (default: "default")
    #[serde(default = "default_job_name")]
    pub name: String,

    /// Collection identifier (required)
    pub collection: String,

    /// Catalog search filters
    #[serde(default)]
    pub filters: SearchFilters,

    /// Transfer options
    #[serde(default)]
    pub download: DownloadOptions,

    /// Post-processing options
    #[serde(default)]
    pub post_process: PostProcessOptions,

    /// Optional post-search filter applied to the result set
    #[serde(default)]
    pub post_search_filter: Option<PostSearchFilterConfig>,

    /// Maximum number of items to process
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Top-level application configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Logging section
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Jobs, executed in order
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Load and validate a YAML configuration file.
///
/// Relative `download.directory` and `post_process.output_dir` paths are
/// resolved against the config file's parent directory.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
        message: format!("cannot read config file '{}': {e}", path.display()),
        key: None,
    })?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    parse_config(&raw, &base_dir)
}

/// Parse a YAML configuration document (see [`load_config`])
pub fn parse_config(raw: &str, base_dir: &Path) -> Result<AppConfig> {
    let value: serde_yaml::Value = serde_yaml::from_str(raw)?;

    let serde_yaml::Value::Mapping(_) = &value else {
        return Err(Error::config("config file must be a YAML mapping"));
    };

    let value = interpolate_env_vars(value)?;

    if value.get("credentials").is_some() {
        return Err(Error::Config {
            message: "credentials must not be stored in the config file; \
                      set SATFETCH_KEY and SATFETCH_SECRET environment variables instead"
                .to_string(),
            key: Some("credentials".to_string()),
        });
    }

    let mut config: AppConfig = serde_yaml::from_value(value)?;

    if config.jobs.is_empty() {
        return Err(Error::config("config must contain at least one job"));
    }
    for job in &mut config.jobs {
        if job.collection.is_empty() {
            return Err(Error::Config {
                message: format!("job '{}' is missing required 'collection' field", job.name),
                key: Some("collection".to_string()),
            });
        }
        job.download.directory = resolve_path(&job.download.directory, base_dir);
        job.post_process.output_dir = resolve_path(&job.post_process.output_dir, base_dir);
    }

    Ok(config)
}

/// Parse an ISO-8601 datetime, accepting a trailing `Z` and a missing
/// seconds component.
pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    let normalized = if let Some(stripped) = value.strip_suffix('Z') {
        format!("{stripped}+00:00")
    } else {
        value.to_string()
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Ok(dt.with_timezone(&Utc));
    }
    // No-seconds form, e.g. "2024-01-01T00:00Z"
    if let Ok(dt) = DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M%:z") {
        return Ok(dt.with_timezone(&Utc));
    }

    Err(Error::config(format!("invalid datetime: '{value}'")))
}

/// Datetime formatting used in catalog queries
pub(crate) fn format_query_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn resolve_path(p: &Path, base_dir: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"\$\{(\w+)\}").expect("static regex"))
}

/// Recursively replace `${VAR}` in every string value; a reference to an
/// unset variable is fatal.
fn interpolate_env_vars(value: serde_yaml::Value) -> Result<serde_yaml::Value> {
    match value {
        serde_yaml::Value::String(s) => Ok(serde_yaml::Value::String(interpolate_string(&s)?)),
        serde_yaml::Value::Sequence(seq) => Ok(serde_yaml::Value::Sequence(
            seq.into_iter()
                .map(interpolate_env_vars)
                .collect::<Result<Vec<_>>>()?,
        )),
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(k, interpolate_env_vars(v)?);
            }
            Ok(serde_yaml::Value::Mapping(out))
        }
        other => Ok(other),
    }
}

fn interpolate_string(s: &str) -> Result<String> {
    let mut result = String::with_capacity(s.len());
    let mut last = 0;
    for caps in env_var_pattern().captures_iter(s) {
        #[allow(clippy::expect_used)]
        let whole = caps.get(0).expect("match always has group 0");
        let name = &caps[1];
        let value = std::env::var(name).map_err(|_| Error::Config {
            message: format!("environment variable '{name}' is not set"),
            key: Some(name.to_string()),
        })?;
        if value.is_empty() {
            return Err(Error::Config {
                message: format!("environment variable '{name}' is not set"),
                key: Some(name.to_string()),
            });
        }
        result.push_str(&s[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }
    result.push_str(&s[last..]);
    Ok(result)
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_job_name() -> String {
    "default".to_string()
}

fn default_sort() -> String {
    "start,time,1".to_string()
}

/// Serde adapter for optional ISO-8601 datetimes with flexible parsing
mod flexible_datetime {
    use super::parse_datetime;
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| parse_datetime(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
