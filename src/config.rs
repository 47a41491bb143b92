//! Service configuration, resolved from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default listen port when `PORT` is absent or empty.
pub const DEFAULT_PORT: u16 = 8000;

/// Largest accepted archive upload, in bytes.
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 2_000_000;

/// Top-level configuration for the build service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server listens on.
    pub port: u16,
    /// Number of workers, and therefore sandbox slots.
    pub workers: usize,
    /// Archive bodies larger than this are rejected as too large.
    pub max_archive_bytes: u64,
    /// How many jobs may wait for a free worker before requests are refused.
    pub queue_capacity: usize,
    /// Parent directory of the per-slot sandbox directories.
    pub sandbox_root: PathBuf,
    /// Whether extended permission bits (suid, sticky) in the archive are kept.
    pub preserve_permissions: bool,
    pub toolchain: ToolchainConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workers: 5,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            queue_capacity: 64,
            sandbox_root: PathBuf::from("/tmp/buildbox"),
            preserve_permissions: false,
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl Config {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            port: parse_optional_env("PORT", defaults.port)?,
            workers: parse_optional_env("BUILDBOX_WORKERS", defaults.workers)?,
            max_archive_bytes: parse_optional_env(
                "BUILDBOX_MAX_ARCHIVE_BYTES",
                defaults.max_archive_bytes,
            )?,
            queue_capacity: parse_optional_env("BUILDBOX_QUEUE_CAPACITY", defaults.queue_capacity)?,
            sandbox_root: optional_env("BUILDBOX_SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox_root),
            preserve_permissions: parse_optional_env(
                "BUILDBOX_PRESERVE_PERMISSIONS",
                defaults.preserve_permissions,
            )?,
            toolchain: ToolchainConfig::resolve()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the worker pool and queue depend on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BUILDBOX_WORKERS".to_string(),
                message: "at least one worker is required".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BUILDBOX_QUEUE_CAPACITY".to_string(),
                message: "queue capacity must be at least 1".to_string(),
            });
        }
        let limits = &self.toolchain.limits;
        check_kb_limit("BUILDBOX_LIMIT_MEM_KB", limits.address_space_kb)?;
        check_kb_limit("BUILDBOX_LIMIT_FSIZE_KB", limits.file_size_kb)?;
        if self.toolchain.command.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "BUILDBOX_TOOLCHAIN".to_string(),
                message: "toolchain command is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// How the external toolchain is invoked and where it leaves its output.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    /// Program followed by any leading arguments, e.g. `["go"]`.
    pub command: Vec<String>,
    /// Subcommand that fetches and builds a package.
    pub build_args: Vec<String>,
    /// Flag passed before the package when insecure fetches are requested.
    pub insecure_flag: String,
    /// Environment variable naming the toolchain's workspace root.
    pub workspace_var: String,
    /// Directory, relative to the workspace root, that receives binaries.
    pub output_dir: PathBuf,
    pub version_args: Vec<String>,
    pub env_args: Vec<String>,
    /// Wall-clock limit for one toolchain run.
    pub timeout: Duration,
    /// Captured output beyond this many bytes is discarded.
    pub max_log_bytes: usize,
    pub limits: BuildLimits,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            command: vec!["go".to_string()],
            build_args: vec!["get".to_string()],
            insecure_flag: "-insecure".to_string(),
            workspace_var: "GOPATH".to_string(),
            output_dir: PathBuf::from("bin"),
            version_args: vec!["version".to_string()],
            env_args: vec!["tool".to_string(), "dist".to_string(), "env".to_string()],
            timeout: Duration::from_secs(300),
            max_log_bytes: 1024 * 1024,
            limits: BuildLimits::default(),
        }
    }
}

impl ToolchainConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let limits = BuildLimits::resolve()?;

        Ok(Self {
            command: optional_env("BUILDBOX_TOOLCHAIN")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.command),
            workspace_var: optional_env("BUILDBOX_WORKSPACE_VAR").unwrap_or(defaults.workspace_var),
            timeout: Duration::from_secs(parse_optional_env(
                "BUILDBOX_BUILD_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            max_log_bytes: parse_optional_env("BUILDBOX_MAX_LOG_BYTES", defaults.max_log_bytes)?,
            limits,
            ..defaults
        })
    }

    /// The program to execute.
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("go")
    }

    /// Arguments that precede every toolchain invocation.
    pub fn leading_args(&self) -> &[String] {
        self.command.get(1..).unwrap_or(&[])
    }
}

/// Resource limits applied to the toolchain process before exec.
///
/// `None` leaves the inherited limit untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildLimits {
    pub cpu_secs: Option<u64>,
    pub address_space_kb: Option<u64>,
    pub file_size_kb: Option<u64>,
    pub open_files: Option<u64>,
}

impl Default for BuildLimits {
    fn default() -> Self {
        Self {
            cpu_secs: Some(600),
            // The Go toolchain reserves a lot of virtual address space.
            address_space_kb: None,
            file_size_kb: Some(1024 * 1024),
            open_files: Some(1024),
        }
    }
}

impl BuildLimits {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            cpu_secs: parse_limit_env("BUILDBOX_LIMIT_CPU_SECS", defaults.cpu_secs)?,
            address_space_kb: parse_kb_limit_env("BUILDBOX_LIMIT_MEM_KB", defaults.address_space_kb)?,
            file_size_kb: parse_kb_limit_env("BUILDBOX_LIMIT_FSIZE_KB", defaults.file_size_kb)?,
            open_files: parse_limit_env("BUILDBOX_LIMIT_NOFILE", defaults.open_files)?,
        })
    }
}

/// Read an env var, treating empty values as absent.
fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_value(key, optional_env(key), default)
}

/// Like [`parse_optional_env`], but `0` or `unlimited` clears the limit.
fn parse_limit_env(key: &str, default: Option<u64>) -> Result<Option<u64>, ConfigError> {
    match optional_env(key).as_deref() {
        None => Ok(default),
        Some("0") | Some("unlimited") => Ok(None),
        Some(raw) => parse_value(key, Some(raw.to_string()), 0).map(Some),
    }
}

/// A kilobyte limit whose byte count must fit in a `u64`.
fn parse_kb_limit_env(key: &str, default: Option<u64>) -> Result<Option<u64>, ConfigError> {
    let limit = parse_limit_env(key, default)?;
    check_kb_limit(key, limit)?;
    Ok(limit)
}

fn check_kb_limit(key: &str, limit: Option<u64>) -> Result<(), ConfigError> {
    match limit {
        Some(kb) if kb.checked_mul(1024).is_none() => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{} KiB overflows a byte count", kb),
        }),
        _ => Ok(()),
    }
}

fn parse_value<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{:?}: {}", raw, e),
        }),
    }
}
