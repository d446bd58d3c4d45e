//! Process configuration assembled once at startup.
//!
//! All knobs are read from the environment exactly once via
//! [`FabricConfig::from_env`]; components receive the resulting values and
//! never consult the environment themselves. Defaults mirror the documented
//! environment surface: stream connection (`REDIS_*`), worker operational
//! settings (`OPS_*`, `ENABLE_DLQ`), persistence allowlists (`PERSIST_*`),
//! and retrieval tuning (`RAG_*`).

use std::collections::BTreeSet;
use std::env;

/// Every table the backing schema knows about. Reads default to all of
/// them; writes are restricted by [`GOVERNANCE_TABLES`].
pub const ALL_TABLES: &[&str] = &[
    "campaigns",
    "clients",
    "conversations",
    "leads",
    "messages",
    "sequences",
    "staging_leads",
    "inquiries",
];

/// Reference tables that must never be writable, regardless of overrides.
pub const GOVERNANCE_TABLES: &[&str] = &["clients", "campaigns"];

/// Stream store connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Full connection URL; preferred when set (handles TLS via `rediss://`).
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    /// Key prefix for every stream and ops key.
    pub namespace: String,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".into(),
            port: 6379,
            db: 0,
            password: None,
            namespace: "agentic".into(),
        }
    }
}

impl StreamSettings {
    /// Connection URL: explicit `url` wins, otherwise assembled from parts.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Worker runtime operational settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Per-task retry ceiling for retryable failures.
    pub max_retries: u32,
    /// Fixed backoff between retries, milliseconds. Zero disables sleeping.
    pub retry_backoff_ms: u64,
    /// Approximate stream trim target applied on publish. `None` = no trim.
    /// Must exceed the worst-case result polling window of any orchestrator.
    pub stream_maxlen: Option<usize>,
    pub enable_dlq: bool,
    pub hb_enabled: bool,
    pub hb_ttl_secs: u64,
    pub hb_interval_secs: u64,
    pub idemp_ttl_secs: u64,
    /// Blocking-read timeout of the claim loop; bounds shutdown latency.
    pub block_ms: u64,
    /// Grace period for in-flight tasks on shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 0,
            stream_maxlen: None,
            enable_dlq: true,
            hb_enabled: true,
            hb_ttl_secs: 30,
            hb_interval_secs: 10,
            idemp_ttl_secs: 60,
            block_ms: 5000,
            shutdown_grace_ms: 5000,
        }
    }
}

/// Resolved persistence allowlists.
///
/// Invariants enforced by [`PersistSettings::resolve`]: governance tables
/// are never writable, and `write ⊆ read`.
#[derive(Debug, Clone)]
pub struct PersistSettings {
    pub read_tables: BTreeSet<String>,
    pub write_tables: BTreeSet<String>,
}

impl PersistSettings {
    /// Resolve allowlists from optional overrides.
    ///
    /// Precedence for writes: explicit list if provided, else all tables;
    /// then the deny set (defaults + extra) is subtracted, and the result
    /// is intersected with the read list.
    pub fn resolve(
        read_override: Option<Vec<String>>,
        write_override: Option<Vec<String>>,
        write_deny_extra: Option<Vec<String>>,
    ) -> Self {
        let read_tables: BTreeSet<String> = read_override
            .unwrap_or_else(|| ALL_TABLES.iter().map(|t| t.to_string()).collect())
            .into_iter()
            .map(|t| t.to_lowercase())
            .collect();

        let mut deny: BTreeSet<String> =
            GOVERNANCE_TABLES.iter().map(|t| t.to_string()).collect();
        deny.extend(
            write_deny_extra
                .unwrap_or_default()
                .into_iter()
                .map(|t| t.to_lowercase()),
        );

        let write_base: Vec<String> = write_override
            .unwrap_or_else(|| ALL_TABLES.iter().map(|t| t.to_string()).collect());
        let write_tables: BTreeSet<String> = write_base
            .into_iter()
            .map(|t| t.to_lowercase())
            .filter(|t| !deny.contains(t))
            .filter(|t| read_tables.contains(t))
            .collect();

        Self {
            read_tables,
            write_tables,
        }
    }
}

impl Default for PersistSettings {
    fn default() -> Self {
        Self::resolve(None, None, None)
    }
}

/// Retrieval agent tuning.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    /// Table queried by default and by the empty-filter default list.
    pub table: String,
    pub default_limit: usize,
    pub max_limit: usize,
    /// Result counts beyond this attach a summary and truncate records.
    pub summary_threshold: usize,
    /// Column the summary groups by.
    pub summary_group_column: String,
    pub max_fallbacks_per_min: usize,
    pub reformulation_max_attempts: usize,
    pub cache_disabled: bool,
    pub default_list_on_empty: bool,
    /// Trailing corporate suffixes stripped by the shorten-company
    /// reformulation strategy (lowercase, compared case-insensitively).
    pub company_suffixes: Vec<String>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            table: "leads".into(),
            default_limit: 50,
            max_limit: 500,
            summary_threshold: 200,
            summary_group_column: "company_name".into(),
            max_fallbacks_per_min: 5,
            reformulation_max_attempts: 3,
            cache_disabled: false,
            default_list_on_empty: false,
            company_suffixes: [
                "inc",
                "inc.",
                "incorporated",
                "llc",
                "l.l.c.",
                "ltd",
                "ltd.",
                "limited",
                "corp",
                "corp.",
                "corporation",
                "co",
                "co.",
                "gmbh",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Top-level configuration value passed to every component.
#[derive(Debug, Clone, Default)]
pub struct FabricConfig {
    pub stream: StreamSettings,
    pub worker: WorkerSettings,
    pub persist: PersistSettings,
    pub retrieval: RetrievalSettings,
}

impl FabricConfig {
    /// Assemble the full configuration from the process environment.
    pub fn from_env() -> Self {
        let stream = StreamSettings {
            url: env_string("REDIS_URL"),
            host: env_string("REDIS_HOST").unwrap_or_else(|| "localhost".into()),
            port: env_parse("REDIS_PORT", 6379),
            db: env_parse("REDIS_DB", 0),
            password: env_string("REDIS_PASSWORD"),
            namespace: env_string("REDIS_NAMESPACE").unwrap_or_else(|| "agentic".into()),
        };

        let defaults = WorkerSettings::default();
        let worker = WorkerSettings {
            max_retries: env_parse("REDIS_MAX_RETRIES", defaults.max_retries),
            retry_backoff_ms: env_parse("REDIS_RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
            stream_maxlen: match env_parse::<usize>("REDIS_STREAM_MAXLEN", 0) {
                0 => None,
                n => Some(n),
            },
            enable_dlq: env_flag("ENABLE_DLQ", defaults.enable_dlq),
            hb_enabled: env_flag("OPS_HB_ENABLED", defaults.hb_enabled),
            hb_ttl_secs: env_parse("OPS_HB_TTL", defaults.hb_ttl_secs),
            hb_interval_secs: env_parse("OPS_HB_INTERVAL", defaults.hb_interval_secs),
            idemp_ttl_secs: env_parse("OPS_IDEMP_TTL", defaults.idemp_ttl_secs),
            block_ms: defaults.block_ms,
            shutdown_grace_ms: defaults.shutdown_grace_ms,
        };

        let persist = PersistSettings::resolve(
            env_list("PERSIST_READ_TABLES"),
            env_list("PERSIST_WRITE_TABLES"),
            env_list("PERSIST_WRITE_DENY"),
        );

        let rdefaults = RetrievalSettings::default();
        let retrieval = RetrievalSettings {
            default_limit: env_parse("RAG_DEFAULT_LIMIT", rdefaults.default_limit),
            max_limit: env_parse("RAG_MAX_LIMIT", rdefaults.max_limit),
            summary_threshold: env_parse("RAG_SUMMARY_THRESHOLD", rdefaults.summary_threshold),
            max_fallbacks_per_min: env_parse(
                "RAG_MAX_FALLBACKS_PER_MIN",
                rdefaults.max_fallbacks_per_min,
            ),
            reformulation_max_attempts: env_parse(
                "RAG_REFORMULATION_MAX_ATTEMPTS",
                rdefaults.reformulation_max_attempts,
            ),
            cache_disabled: env_flag("RAG_CACHE_DISABLED", rdefaults.cache_disabled),
            default_list_on_empty: env_flag(
                "RAG_DEFAULT_LIST_ON_EMPTY",
                rdefaults.default_list_on_empty,
            ),
            ..rdefaults
        };

        Self {
            stream,
            worker,
            persist,
            retrieval,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_string(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Truthy values: `1`, `true`, `yes` (case-insensitive).
fn env_flag(name: &str, default: bool) -> bool {
    match env_string(name) {
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|raw| {
        raw.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_write_allowlist_excludes_governance_tables() {
        let persist = PersistSettings::default();
        assert!(persist.read_tables.contains("clients"));
        assert!(persist.read_tables.contains("campaigns"));
        assert!(!persist.write_tables.contains("clients"));
        assert!(!persist.write_tables.contains("campaigns"));
        assert!(persist.write_tables.contains("leads"));
    }

    #[test]
    fn explicit_write_override_cannot_reintroduce_governance_tables() {
        let persist = PersistSettings::resolve(
            None,
            Some(vec!["leads".into(), "clients".into(), "Campaigns".into()]),
            None,
        );
        assert_eq!(
            persist.write_tables.iter().collect::<Vec<_>>(),
            vec!["leads"]
        );
    }

    #[test]
    fn write_list_is_subset_of_read_list() {
        let persist = PersistSettings::resolve(
            Some(vec!["leads".into()]),
            Some(vec!["leads".into(), "messages".into()]),
            None,
        );
        assert!(persist.write_tables.is_subset(&persist.read_tables));
        assert!(!persist.write_tables.contains("messages"));
    }

    #[test]
    fn extra_deny_is_subtracted() {
        let persist =
            PersistSettings::resolve(None, None, Some(vec!["leads".into(), "MESSAGES".into()]));
        assert!(!persist.write_tables.contains("leads"));
        assert!(!persist.write_tables.contains("messages"));
        assert!(persist.write_tables.contains("sequences"));
    }

    #[test]
    fn connection_url_assembly() {
        let mut settings = StreamSettings::default();
        assert_eq!(settings.connection_url(), "redis://localhost:6379/0");
        settings.password = Some("hunter2".into());
        assert_eq!(settings.connection_url(), "redis://:hunter2@localhost:6379/0");
        settings.url = Some("rediss://cache.internal:6380/1".into());
        assert_eq!(settings.connection_url(), "rediss://cache.internal:6380/1");
    }
}
