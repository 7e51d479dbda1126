use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Sentinel for a value that was present but not a parseable integer.
/// Only the validation boundary distinguishes it from a user-supplied
/// negative number; both are rejected there.
pub const UNPARSEABLE: i64 = -1;

/// Raw per-tier options as they appeared in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTier {
    /// Section header text, e.g. `[Tier 1]` → `"Tier 1"`.
    pub id: String,
    pub path: Option<PathBuf>,
    pub watermark: Option<i64>,
}

impl RawTier {
    fn new(id: String) -> Self {
        RawTier {
            id,
            path: None,
            watermark: None,
        }
    }
}

/// Raw parse output: every recognized option, still unvalidated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConfig {
    pub log_level: Option<i64>,
    pub tier_period: Option<i64>,
    pub copy_buffer_size: Option<i64>,
    pub run_path: Option<PathBuf>,
    pub tiers: Vec<RawTier>,
}

/// Where the parser currently is in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    /// Before any section header; assignments here are ignored.
    Outside,
    /// Inside `[Global]`.
    InGlobal,
    /// Inside the tier section at this index of `RawConfig::tiers`.
    InTier(usize),
}

fn is_global_header(id: &str) -> bool {
    id.trim().eq_ignore_ascii_case("global")
}

/// Strip a trailing `#` comment and surrounding whitespace.
fn clean(line: &str) -> &str {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    line.trim()
}

fn parse_int(value: &str) -> i64 {
    value.parse::<i64>().unwrap_or(UNPARSEABLE)
}

/// Parse config file contents into a [`RawConfig`].
///
/// Never fails: unknown keys, malformed values and misplaced assignments
/// are carried through (or dropped) for the validation boundary to judge.
/// Tier section order in the file is tier priority order.
pub fn parse_str(contents: &str) -> RawConfig {
    let mut raw = RawConfig::default();
    let mut state = ParserState::Outside;

    for line in contents.lines() {
        let line = clean(line);
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let id = rest.split(']').next().unwrap_or(rest).trim().to_string();
            if is_global_header(&id) {
                state = ParserState::InGlobal;
            } else {
                debug!(tier = %id, "found tier section");
                raw.tiers.push(RawTier::new(id));
                state = ParserState::InTier(raw.tiers.len() - 1);
            }
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => continue,
        };
        if key.is_empty() || value.is_empty() {
            continue;
        }

        match state {
            ParserState::Outside => {}
            ParserState::InGlobal => match key {
                "Log Level" => raw.log_level = Some(parse_int(value)),
                "Tier Period" => raw.tier_period = Some(parse_int(value)),
                "Copy Buffer Size" => raw.copy_buffer_size = Some(parse_int(value)),
                "Run Path" => raw.run_path = Some(PathBuf::from(value)),
                _ => {}
            },
            ParserState::InTier(i) => {
                let tier = &mut raw.tiers[i];
                match key {
                    "Path" => {
                        debug!(tier = %tier.id, path = value, "found tier path");
                        tier.path = Some(PathBuf::from(value));
                    }
                    "Watermark" => {
                        debug!(tier = %tier.id, watermark = value, "found tier watermark");
                        tier.watermark = Some(parse_int(value));
                    }
                    _ => {}
                }
            }
        }
    }

    raw
}

const DEFAULT_TEMPLATE: &str = "\
# autotier config
[Global]                       # global settings
Log Level = 1                  # 0 = none, 1 = normal, 2 = debug
Tier Period = 1000             # number of seconds between file move batches

[Tier 1]                       # tier name
Path =                         # full path to tier storage pool
Watermark =                    # % usage at which to stop filling tier

[Tier 2]
Path =
Watermark =
# ... (add as many tiers as you like)
";

/// Write the commented default template to `path`, creating parent
/// directories as needed.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_TEMPLATE)?;
    Ok(())
}
