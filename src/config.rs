use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::{mlog_debug, Error, Result};

/// Default quality score a verdict must reach to pass.
pub const DEFAULT_QUALITY_THRESHOLD: u8 = 85;

/// Default step budget for one Actor attempt.
pub const DEFAULT_ACTOR_MAX_STEPS: u32 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Trust level 1–5; higher trust grants the loop more autonomy.
    #[serde(default = "default_trust")]
    pub trust: u8,
    /// Minimum quality score for a passing verdict.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: u8,
    /// Overrides the trust-derived retry budget when set.
    pub max_retries: Option<u32>,
    /// Step budget for one Actor attempt.
    #[serde(default = "default_actor_max_steps")]
    pub actor_max_steps: u32,
    /// Directory scanned for queued project directories.
    pub projects_dir: Option<String>,
    /// Directory where attempt worktrees are created.
    pub worktree_dir: Option<String>,
}

fn default_trust() -> u8 {
    2
}

fn default_quality_threshold() -> u8 {
    DEFAULT_QUALITY_THRESHOLD
}

fn default_actor_max_steps() -> u32 {
    DEFAULT_ACTOR_MAX_STEPS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trust: default_trust(),
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            max_retries: None,
            actor_max_steps: DEFAULT_ACTOR_MAX_STEPS,
            projects_dir: None,
            worktree_dir: None,
        }
    }
}

impl Config {
    pub fn data_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".midnight"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("midnight.toml"))
    }

    pub fn pid_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("midnight.pid"))
    }

    pub fn socket_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("midnight.sock"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("midnight.log"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::data_dir()?.join("worktrees")),
        }
    }

    pub fn projects_dir(&self) -> Result<PathBuf> {
        match &self.projects_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::data_dir()?.join("projects")),
        }
    }

    /// Effective retry budget: explicit override wins, otherwise the
    /// trust level maps directly (see `LoopPolicy::from_trust`).
    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries
            .unwrap_or_else(|| u32::from(self.trust.clamp(1, 5)))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        mlog_debug!(
            "Config loaded: trust={}, quality_threshold={}, max_retries={:?}",
            config.trust,
            config.quality_threshold,
            config.max_retries
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let data_dir = Self::data_dir()?;
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let data_dir = Self::data_dir()?;
        let worktrees = self.worktrees_dir()?;
        let projects = self.projects_dir()?;
        for dir in [&data_dir, &worktrees, &projects] {
            if !dir.exists() {
                mlog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
