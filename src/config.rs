//! Process configuration
//!
//! Every flag can also come from the environment (or a `.env` file loaded
//! in `main`). Cross-field rules live in `Args::validate`.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use uuid::Uuid;

/// Handoff - donation fulfillment service
#[derive(Parser, Debug, Clone)]
#[command(name = "handoff", version)]
#[command(about = "Claims, deliveries and completion confirmation for donated goods")]
pub struct Args {
    /// Identifies this instance in logs, health and the NATS connection name
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// HTTP bind address
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Fall back to in-process stand-ins when NATS or MongoDB are unreachable
    #[arg(long, env = "DEV_MODE", default_value_t = false)]
    pub dev_mode: bool,

    #[arg(long, env = "STORE_BACKEND", value_enum, default_value_t = StoreBackend::Mongo)]
    pub store_backend: StoreBackend,

    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    #[arg(long, env = "MONGODB_DB", default_value = "handoff")]
    pub mongodb_db: String,

    #[command(flatten)]
    pub nats: NatsArgs,

    #[command(flatten)]
    pub cache: CacheArgs,

    /// Optimistic claim attempts before reporting the donation as taken
    #[arg(long, env = "CLAIM_MAX_ATTEMPTS", default_value_t = 3)]
    pub claim_max_attempts: u32,

    /// Page size when a list request gives none
    #[arg(long, env = "DEFAULT_PAGE_SIZE", default_value_t = 20)]
    pub default_page_size: u32,

    /// Largest page a list request may ask for
    #[arg(long, env = "MAX_PAGE_SIZE", default_value_t = 100)]
    pub max_page_size: u32,

    /// Directive for the `handoff` target; RUST_LOG overrides it entirely
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Mongo,
    Memory,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// Used only together with `--nats-password`
    #[arg(long, env = "NATS_USER", requires = "nats_password")]
    pub nats_user: Option<String>,

    #[arg(long, env = "NATS_PASSWORD", hide_env_values = true)]
    pub nats_password: Option<String>,

    /// Prepended to every published subject
    #[arg(long, env = "NATS_SUBJECT_PREFIX", default_value = "handoff")]
    pub nats_subject_prefix: String,
}

#[derive(Parser, Debug, Clone)]
pub struct CacheArgs {
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value_t = 10_000)]
    pub cache_max_entries: usize,

    /// TTL for shared lists and single donations
    #[arg(long, env = "CACHE_LIST_TTL_SECS", default_value_t = 300)]
    pub cache_list_ttl_secs: u64,

    /// TTL for per-user views
    #[arg(long, env = "CACHE_USER_TTL_SECS", default_value_t = 60)]
    pub cache_user_ttl_secs: u64,
}

impl Args {
    /// Check cross-field rules, reporting every violation at once
    pub fn validate(&self) -> Result<(), String> {
        let rules = [
            (self.claim_max_attempts == 0, "CLAIM_MAX_ATTEMPTS must be at least 1"),
            (self.default_page_size == 0, "DEFAULT_PAGE_SIZE must be positive"),
            (self.max_page_size == 0, "MAX_PAGE_SIZE must be positive"),
            (
                self.default_page_size > self.max_page_size,
                "DEFAULT_PAGE_SIZE must not exceed MAX_PAGE_SIZE",
            ),
            (self.cache.cache_max_entries == 0, "CACHE_MAX_ENTRIES must be positive"),
            (
                self.nats.nats_subject_prefix.trim_matches('.').is_empty(),
                "NATS_SUBJECT_PREFIX must not be empty",
            ),
        ];

        let broken: Vec<&str> = rules
            .iter()
            .filter(|(violated, _)| *violated)
            .map(|(_, rule)| *rule)
            .collect();
        if broken.is_empty() {
            Ok(())
        } else {
            Err(broken.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["handoff"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_validate() {
        let args = parse(&[]);
        assert!(args.validate().is_ok());
        assert_eq!(args.store_backend, StoreBackend::Mongo);
        assert_eq!(args.claim_max_attempts, 3);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let args = parse(&["--claim-max-attempts", "0"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_rejects_default_page_over_max() {
        let args = parse(&["--default-page-size", "50", "--max-page-size", "10"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_reports_every_violation() {
        let args = parse(&["--claim-max-attempts", "0", "--nats-subject-prefix", "."]);
        let err = args.validate().unwrap_err();
        assert!(err.contains("CLAIM_MAX_ATTEMPTS"));
        assert!(err.contains("NATS_SUBJECT_PREFIX"));
    }

    #[test]
    fn test_memory_backend_flag() {
        let args = parse(&["--store-backend", "memory", "--log-format", "json"]);
        assert_eq!(args.store_backend, StoreBackend::Memory);
        assert_eq!(args.log_format, LogFormat::Json);
    }
}
