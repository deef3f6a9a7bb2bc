use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{ForemanError, Result};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    pub general: GeneralConfig,
    pub engines: Vec<EngineConfig>,
    pub reaper: ReaperConfig,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            engines: EngineConfig::default_set(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl ForemanConfig {
    /// Load config from a specific `foreman.toml` file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ForemanError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ForemanError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `./foreman.toml` if it exists, otherwise return defaults.
    pub fn load_or_default() -> Self {
        let path = PathBuf::from("foreman.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(%e, "failed to load foreman.toml, falling back to defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    /// Validate the config and return actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.general.window_size == 0 {
            return Err(ForemanError::Config("general.window_size must be > 0".into()));
        }
        if self.general.max_attempts == 0 {
            return Err(ForemanError::Config("general.max_attempts must be > 0".into()));
        }
        if self.general.engine_timeout_seconds == 0 {
            return Err(ForemanError::Config(
                "general.engine_timeout_seconds must be > 0".into(),
            ));
        }
        if self.general.slot_timeout_seconds <= self.general.engine_timeout_seconds {
            return Err(ForemanError::Config(
                "general.slot_timeout_seconds must be greater than general.engine_timeout_seconds"
                    .into(),
            ));
        }
        if self.general.base_branch.trim().is_empty() {
            return Err(ForemanError::Config("general.base_branch must be set".into()));
        }

        if self.engines.is_empty() {
            return Err(ForemanError::Config(
                "at least one [[engines]] entry is required".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for (i, engine) in self.engines.iter().enumerate() {
            if engine.name.trim().is_empty() {
                return Err(ForemanError::Config(format!("engines[{i}].name is empty")));
            }
            if engine.program.trim().is_empty() {
                return Err(ForemanError::Config(format!(
                    "engines[{i}] ('{}') has an empty program",
                    engine.name
                )));
            }
            if !seen.insert(engine.name.clone()) {
                return Err(ForemanError::Config(format!(
                    "duplicate engine name '{}'",
                    engine.name
                )));
            }
            if !engine.args.iter().any(|a| a.contains("{prompt}")) {
                warn!(
                    engine = %engine.name,
                    "engine args carry no {{prompt}} placeholder; the prompt will not reach it"
                );
            }
        }

        if self.general.slot_warn_seconds >= self.general.slot_timeout_seconds {
            warn!(
                warn = self.general.slot_warn_seconds,
                hard = self.general.slot_timeout_seconds,
                "slot_warn_seconds is not below slot_timeout_seconds; warnings will never fire"
            );
        }

        Ok(())
    }

    /// Engine spec by name, if configured.
    pub fn engine(&self, name: &str) -> Option<&EngineConfig> {
        self.engines.iter().find(|e| e.name == name)
    }

    /// The primary engine followed by the configured alternates, in order.
    pub fn engine_order(&self) -> Vec<EngineConfig> {
        self.engines.clone()
    }
}

// ---------------------------------------------------------------------------
// GeneralConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Branch successful attempts integrate into.
    pub base_branch: String,
    /// Maximum number of slots in running/merging at once.
    pub window_size: usize,
    /// Total attempts per work item (attempt indices `0..max_attempts`).
    pub max_attempts: u32,
    /// Hard timeout for a single engine invocation.
    pub engine_timeout_seconds: u64,
    /// Hard timeout for a whole slot; the supervisor kills the engine past it.
    pub slot_timeout_seconds: u64,
    /// Elapsed time after which a running slot starts emitting warnings.
    pub slot_warn_seconds: u64,
    /// Backoff before retrying a rate-limited attempt.
    pub rate_limit_backoff_seconds: u64,
    /// Closed-then-reopened cycles after which an item is blocked.
    pub max_reopen_cycles: u32,
    /// Width failure comments are truncated to.
    pub comment_width: usize,
    /// Prompt preamble prepended to every engine invocation.
    pub prompt_preamble: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".into(),
            window_size: 3,
            max_attempts: 3,
            engine_timeout_seconds: 1800,
            slot_timeout_seconds: 2700,
            slot_warn_seconds: 900,
            rate_limit_backoff_seconds: 30,
            max_reopen_cycles: 3,
            comment_width: 1000,
            prompt_preamble: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// One external engine command. `{prompt}` and `{issue}` in `args` are
/// substituted at spawn time; the prompt is never shell-interpolated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Extra patterns (besides the built-ins) recognised as rate limiting.
    pub rate_limit_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            program: String::new(),
            args: vec![],
            rate_limit_patterns: vec![],
        }
    }
}

impl EngineConfig {
    /// The stock engine set used when no config file overrides it.
    pub fn default_set() -> Vec<Self> {
        vec![
            Self {
                name: "claude".into(),
                program: "claude".into(),
                args: vec![
                    "-p".into(),
                    "{prompt}".into(),
                    "--output-format".into(),
                    "json".into(),
                ],
                rate_limit_patterns: vec![],
            },
            Self {
                name: "opencode".into(),
                program: "opencode".into(),
                args: vec!["run".into(), "{prompt}".into()],
                rate_limit_patterns: vec![],
            },
            Self {
                name: "codex".into(),
                program: "codex".into(),
                args: vec!["exec".into(), "{prompt}".into()],
                rate_limit_patterns: vec![],
            },
        ]
    }
}

// ---------------------------------------------------------------------------
// ReaperConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Command substrings that mark a process as a likely engine orphan.
    pub orphan_patterns: Vec<String>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            orphan_patterns: vec![
                "vitest".into(),
                "jest --watch".into(),
                "tsc --watch".into(),
                "cargo watch".into(),
                "nodemon".into(),
                "watchman".into(),
            ],
        }
    }
}
