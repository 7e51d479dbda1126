use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::parse::RawConfig;

/// Verbosity selected by the config file's `Log Level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// 0: errors only.
    None,
    /// 1: normal operation messages.
    #[default]
    Normal,
    /// 2: per-operation debug output.
    Debug,
}

impl LogLevel {
    fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(LogLevel::None),
            1 => Some(LogLevel::Normal),
            2 => Some(LogLevel::Debug),
            _ => None,
        }
    }

    /// Numeric form, as written in the config file.
    pub fn as_int(self) -> u8 {
        match self {
            LogLevel::None => 0,
            LogLevel::Normal => 1,
            LogLevel::Debug => 2,
        }
    }
}

/// One validated tier definition, in priority order (index 0 = fastest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSpec {
    /// Section header from the config file; stable human-readable id.
    pub id: String,
    /// Absolute backing directory.
    pub path: PathBuf,
    /// Target maximum fill, percent in [0, 100].
    pub watermark: u8,
}

/// The validated configuration record consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_level: LogLevel,
    /// Seconds between policy ticks (>= 1).
    pub tier_period: Duration,
    /// Stream-copy buffer size for cross-filesystem migrations.
    pub copy_buffer_size: usize,
    /// Directory holding runtime artifacts (control socket).
    pub run_path: PathBuf,
    /// Tiers, fastest first.
    pub tiers: Vec<TierSpec>,
}

pub const DEFAULT_COPY_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_RUN_PATH: &str = "/var/lib/autotier";

impl Config {
    /// Runtime directory for this instance: the run path suffixed with a
    /// hash of the config path, so instances with different configs never
    /// collide.
    pub fn instance_run_dir(&self, config_path: &Path) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        config_path.hash(&mut hasher);
        self.run_path.join(format!("{:016x}", hasher.finish()))
    }

    /// Control socket location for this instance.
    pub fn control_socket_path(&self, config_path: &Path) -> PathBuf {
        self.instance_run_dir(config_path).join("control.socket")
    }

    /// Render the loaded options back in config-file form (for the
    /// `config` ad-hoc command).
    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str("[Global]\n");
        out.push_str(&format!("Log Level = {}\n", self.log_level.as_int()));
        out.push_str(&format!("Tier Period = {}\n", self.tier_period.as_secs()));
        out.push_str(&format!("Copy Buffer Size = {}\n", self.copy_buffer_size));
        out.push_str(&format!("Run Path = {}\n", self.run_path.display()));
        for tier in &self.tiers {
            out.push_str(&format!("\n[{}]\n", tier.id));
            out.push_str(&format!("Path = {}\n", tier.path.display()));
            out.push_str(&format!("Watermark = {}\n", tier.watermark));
        }
        out
    }
}

/// Validate a [`RawConfig`] into a [`Config`].
///
/// All failed checks are collected so the operator sees every mistake at
/// once rather than one per restart.
pub fn validate(config_path: &Path, raw: RawConfig) -> Result<Config> {
    let mut problems = Vec::new();

    let log_level = match raw.log_level {
        None => LogLevel::default(),
        Some(v) => LogLevel::from_raw(v).unwrap_or_else(|| {
            problems.push(format!("invalid Log Level: must be 0, 1 or 2, got {v}"));
            LogLevel::default()
        }),
    };

    let tier_period = match raw.tier_period {
        None => {
            problems.push("Tier Period is not set".to_string());
            Duration::from_secs(0)
        }
        Some(v) if v >= 1 => Duration::from_secs(v as u64),
        Some(v) => {
            problems.push(format!("invalid Tier Period: must be >= 1 second, got {v}"));
            Duration::from_secs(0)
        }
    };

    let copy_buffer_size = match raw.copy_buffer_size {
        None => DEFAULT_COPY_BUFFER_SIZE,
        Some(v) if v >= 1 => v as usize,
        Some(v) => {
            problems.push(format!("invalid Copy Buffer Size: must be >= 1 byte, got {v}"));
            DEFAULT_COPY_BUFFER_SIZE
        }
    };

    let run_path = match raw.run_path {
        None => PathBuf::from(DEFAULT_RUN_PATH),
        Some(p) if p.is_absolute() => p,
        Some(p) => {
            problems.push(format!(
                "Run Path must be an absolute path: \"{}\"",
                p.display()
            ));
            PathBuf::from(DEFAULT_RUN_PATH)
        }
    };

    match raw.tiers.len() {
        0 => problems.push("no tiers defined".to_string()),
        1 => problems.push("only one tier is defined; two or more are needed".to_string()),
        _ => {}
    }

    let mut tiers = Vec::with_capacity(raw.tiers.len());
    for tier in raw.tiers {
        let mut ok = true;

        let path = match tier.path {
            None => {
                problems.push(format!("{}: Path is not set", tier.id));
                ok = false;
                PathBuf::new()
            }
            Some(p) if !p.is_absolute() => {
                problems.push(format!(
                    "{}: Path must be absolute: \"{}\"",
                    tier.id,
                    p.display()
                ));
                ok = false;
                p
            }
            Some(p) => {
                if !p.is_dir() {
                    problems.push(format!("{}: not a directory: \"{}\"", tier.id, p.display()));
                    ok = false;
                }
                p
            }
        };

        let watermark = match tier.watermark {
            None => {
                problems.push(format!("{}: Watermark is not set", tier.id));
                ok = false;
                0
            }
            Some(v @ 0..=100) => v as u8,
            Some(v) => {
                problems.push(format!(
                    "{}: invalid Watermark: must be 0-100, got {v}",
                    tier.id
                ));
                ok = false;
                0
            }
        };

        if ok {
            tiers.push(TierSpec {
                id: tier.id,
                path,
                watermark,
            });
        }
    }

    if !problems.is_empty() {
        return Err(ConfigError::Invalid {
            path: config_path.display().to_string(),
            problems,
        });
    }

    Ok(Config {
        log_level,
        tier_period,
        copy_buffer_size,
        run_path,
        tiers,
    })
}
