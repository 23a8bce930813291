//! Typed startup configuration, consolidating the environment variables
//! into a single value built once and passed down instead of scattered
//! `env::var` calls at arbitrary points in the request path.

use std::path::PathBuf;
use std::time::Duration;

/// Default streaming chunk size for the direct (uncached) path: 32 KiB.
const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Default pack-cache target size: 20 GiB.
const DEFAULT_PACK_CACHE_SIZE_GB: u64 = 20;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the on-disk layout (`git/`, `pack_cache/`, `bundles/`).
    pub working_directory: PathBuf,

    /// Upstream Git server this proxy mirrors and forwards to.
    pub upstream: String,

    /// Upload-pack permit count: `min(MAX_GIT_UPLOAD_PACK, num_cpus)`.
    pub max_git_upload_pack: usize,

    /// Eviction target for the pack cache, in bytes: `(N*1024 - 512) MiB`.
    pub pack_cache_target_bytes: u64,

    /// Allow caching when `|wants| > 1`.
    pub pack_cache_multi: bool,

    /// Allow caching when a `deepen-*` line was present.
    pub pack_cache_depth: bool,

    /// Seconds of grace before sending SIGTERM to a lingering child.
    pub git_process_wait_timeout: Duration,

    /// Retry backoff base for clone/fetch.
    pub backoff_start: Duration,

    /// Retry attempt count for clone/fetch.
    pub backoff_count: u32,

    /// Streaming chunk size for the direct (uncached) response path.
    pub chunk_size: usize,

    /// Disable TLS verification against the upstream (development only).
    pub git_ssl_no_verify: bool,

    /// `--progress`/`--no-progress` flag passed through to clone/fetch.
    pub git_progress_option: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be a positive integer, got {1:?}")]
    InvalidInteger(&'static str, String),
}

impl Config {
    /// Build configuration from the process environment, applying
    /// documented defaults. Parsing failures are startup errors: a
    /// malformed `PACK_CACHE_SIZE_GB` must fail fast at boot, not on the
    /// first request.
    pub fn from_env(working_directory: PathBuf, upstream: String) -> Result<Self, ConfigError> {
        let max_git_upload_pack = env_u64("MAX_GIT_UPLOAD_PACK")?
            .map(|n| n as usize)
            .unwrap_or_else(num_cpus::get)
            .min(num_cpus::get().max(1));

        let pack_cache_size_gb = env_u64("PACK_CACHE_SIZE_GB")?.unwrap_or(DEFAULT_PACK_CACHE_SIZE_GB);
        let pack_cache_target_bytes = pack_cache_size_gb
            .saturating_mul(1024)
            .saturating_sub(512)
            .saturating_mul(1024 * 1024);

        let backoff_start = env_f64("BACKOFF_START")?.unwrap_or(0.5);
        let backoff_count = env_u64("BACKOFF_COUNT")?.unwrap_or(5) as u32;

        let git_process_wait_timeout = env_u64("GIT_PROCESS_WAIT_TIMEOUT")?.unwrap_or(2);

        let chunk_size = env_u64("CHUNK_SIZE")?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_CHUNK_SIZE);

        Ok(Config {
            working_directory,
            upstream,
            max_git_upload_pack: max_git_upload_pack.max(1),
            pack_cache_target_bytes,
            pack_cache_multi: env_bool("PACK_CACHE_MULTI"),
            pack_cache_depth: env_bool("PACK_CACHE_DEPTH"),
            git_process_wait_timeout: Duration::from_secs(git_process_wait_timeout),
            backoff_start: Duration::from_secs_f64(backoff_start),
            backoff_count,
            chunk_size,
            git_ssl_no_verify: std::env::var_os("GIT_SSL_NO_VERIFY").is_some(),
            git_progress_option: if std::env::var("GIT_PROGRESS_OPTION").as_deref()
                == Ok("--no-progress")
            {
                "--no-progress"
            } else {
                "--progress"
            },
        })
    }

    pub fn git_dir(&self) -> PathBuf {
        self.working_directory.join("git")
    }

    pub fn pack_cache_dir(&self) -> PathBuf {
        self.working_directory.join("pack_cache")
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.working_directory.join("bundles")
    }
}

/// Truthiness used by `PACK_CACHE_MULTI`/`PACK_CACHE_DEPTH`: the lowercased
/// value must equal exactly `"true"` or `"1"`; anything else, including
/// unset, is falsy.
fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false)
}

fn env_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidInteger(name, v)),
        Err(_) => Ok(None),
    }
}

fn env_f64(name: &'static str) -> Result<Option<f64>, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidInteger(name, v)),
        Err(_) => Ok(None),
    }
}
