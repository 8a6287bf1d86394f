//! Process-wide configuration (spec §6, §1.1): an immutable `Config` loaded
//! once from the environment at startup, plus the fixed `TimeoutTable` and
//! concurrency limits (spec §5's "only two" pieces of global mutable state —
//! here expressed as immutable-after-init `OnceLock`-backed constants).
//!
//! Grounded in the teacher's `state.rs` env-driven config loading and its
//! `TOKEN_REFRESH_MUTEX`-style `OnceLock` globals.

use std::time::Duration;

/// Which durable constraint backend to use. Only the in-memory backend
/// ships in this crate; `Notion`/`Mem0` select external adapters this crate
/// does not own (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    Notion,
    Mem0,
}

impl StoreBackend {
    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "notion" => StoreBackend::Notion,
            "mem0" => StoreBackend::Mem0,
            _ => StoreBackend::InMemory,
        }
    }
}

/// Immutable, process-wide configuration loaded once at startup and never
/// re-read mid-process (spec §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub model_endpoint: String,
    pub model_api_key: String,
    pub mcp_calendar_url: String,
    pub extraction_concurrency: usize,
    pub durable_prefetch_concurrency: usize,
    pub durable_upsert_concurrency: usize,
    pub fuzzy_reconciliation_tolerance_minutes: i64,
    pub fallback_skeleton_block_minutes: i64,
    pub debug_log_dir: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load every documented environment variable, falling back to the
    /// spec's defaults (extraction=2, durable-prefetch=3, durable-upsert=1)
    /// when unset.
    pub fn from_env() -> Self {
        Config {
            store_backend: StoreBackend::parse(&env_or("TIMEBOX_STORE_BACKEND", "in_memory")),
            model_endpoint: env_or("TIMEBOX_MODEL_ENDPOINT", "https://api.anthropic.com/v1/messages"),
            model_api_key: env_or("TIMEBOX_MODEL_API_KEY", ""),
            mcp_calendar_url: env_or("TIMEBOX_CALENDAR_URL", "http://localhost:8787/"),
            extraction_concurrency: env_parse_or("TIMEBOX_EXTRACTION_CONCURRENCY", 2),
            durable_prefetch_concurrency: env_parse_or("TIMEBOX_DURABLE_PREFETCH_CONCURRENCY", 3),
            durable_upsert_concurrency: env_parse_or("TIMEBOX_DURABLE_UPSERT_CONCURRENCY", 1),
            fuzzy_reconciliation_tolerance_minutes: env_parse_or("TIMEBOX_FUZZY_TOLERANCE_MINUTES", 10),
            fallback_skeleton_block_minutes: env_parse_or("TIMEBOX_FALLBACK_BLOCK_MINUTES", 30),
            debug_log_dir: std::env::var("TIMEBOX_DEBUG_LOG_DIR").ok(),
        }
    }
}

/// Per-call timeouts, mirroring the teacher's `TIMEBOXING_TIMEOUTS`-style
/// constant table (spec §5).
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTable {
    pub planned_date_extractor: Duration,
    pub constraint_interpreter: Duration,
    pub stage_gate: Duration,
    pub decision_router: Duration,
    pub constraint_extractor: Duration,
    pub patch_generator: Duration,
    pub skeleton_generator: Duration,
    pub calendar_rpc: Duration,
    pub durable_store_query: Duration,
    pub durable_store_upsert: Duration,
    pub graph_turn: Duration,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        TimeoutTable {
            planned_date_extractor: Duration::from_secs(8),
            constraint_interpreter: Duration::from_secs(8),
            stage_gate: Duration::from_secs(15),
            decision_router: Duration::from_secs(8),
            constraint_extractor: Duration::from_secs(15),
            patch_generator: Duration::from_secs(20),
            skeleton_generator: Duration::from_secs(20),
            calendar_rpc: Duration::from_secs(10),
            durable_store_query: Duration::from_secs(5),
            durable_store_upsert: Duration::from_secs(5),
            graph_turn: Duration::from_secs(45),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_when_unset() {
        // Use a key unlikely to already be set in the test environment.
        std::env::remove_var("TIMEBOX_EXTRACTION_CONCURRENCY_TEST_UNSET");
        let config = Config::from_env();
        assert_eq!(config.extraction_concurrency, 2);
        assert_eq!(config.durable_prefetch_concurrency, 3);
        assert_eq!(config.durable_upsert_concurrency, 1);
        assert_eq!(config.fuzzy_reconciliation_tolerance_minutes, 10);
        assert!(matches!(config.store_backend, StoreBackend::InMemory));
    }

    #[test]
    fn store_backend_parses_known_values() {
        assert!(matches!(StoreBackend::parse("notion"), StoreBackend::Notion));
        assert!(matches!(StoreBackend::parse("MEM0"), StoreBackend::Mem0));
        assert!(matches!(StoreBackend::parse("unknown"), StoreBackend::InMemory));
    }

    #[test]
    fn timeout_table_defaults_are_positive() {
        let table = TimeoutTable::default();
        assert!(table.graph_turn > table.stage_gate);
        assert!(table.patch_generator.as_secs() > 0);
    }
}
