//! Configuration loading and merging (C8): CLI flags override environment
//! variables, which override an optional on-disk profile file, which
//! override the built-in defaults below.

use crate::log::LogLevel;
use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Per-process cache policy. Kept as three distinct variants rather than
/// coercing `"force"` into a boolean: `force` always reruns, `true` reuses
/// when the signature is valid, and `false` never reuses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    True,
    False,
    Force,
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(Self::True),
            "false" | "f" | "0" | "no" => Ok(Self::False),
            "force" => Ok(Self::Force),
            other => Err(format!("invalid cache policy {other:?}")),
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::True
    }
}

/// What a process does when one of its jobs fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    #[default]
    Halt,
    Ignore,
    Retry,
}

impl FromStr for ErrorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "halt" => Ok(Self::Halt),
            "ignore" => Ok(Self::Ignore),
            "retry" => Ok(Self::Retry),
            other => Err(format!("invalid error strategy {other:?}")),
        }
    }
}

/// On-disk profile file, loaded from TOML. Every field is optional: a
/// missing file, or a missing field within a present file, falls through
/// to the environment/CLI/default layers.
#[derive(Debug, Default, Deserialize)]
pub struct ProfileFile {
    pub workdir: Option<PathBuf>,
    pub outdir: Option<PathBuf>,
    pub forks: Option<usize>,
    pub cache: Option<CachePolicy>,
    pub scheduler: Option<String>,
    pub loglevel: Option<String>,
    pub plugins: Option<Vec<String>>,
}

/// Values read from `PIPEN_*` environment variables.
#[derive(Debug, Default)]
pub struct EnvOverrides {
    pub workdir: Option<PathBuf>,
    pub outdir: Option<PathBuf>,
    pub forks: Option<usize>,
    pub loglevel: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            workdir: std::env::var_os("PIPEN_WORKDIR").map(PathBuf::from),
            outdir: std::env::var_os("PIPEN_OUTDIR").map(PathBuf::from),
            forks: std::env::var("PIPEN_FORKS")
                .ok()
                .and_then(|s| s.parse().ok()),
            loglevel: std::env::var("PIPEN_LOGLEVEL").ok(),
        }
    }
}

/// The fully-merged engine configuration, ready to build a `Pipeline` from.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workdir: PathBuf,
    pub outdir: PathBuf,
    pub forks: usize,
    pub cache: CachePolicy,
    pub scheduler: String,
    pub loglevel: LogLevel,
    pub plugins: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from(".pipen"),
            outdir: PathBuf::from("./pipen-output"),
            forks: 1,
            cache: CachePolicy::default(),
            scheduler: "local".to_owned(),
            loglevel: LogLevel::Info,
            plugins: Vec::new(),
        }
    }
}

/// Location of the default profile file: `$XDG_CONFIG_HOME/pipen/<name>.toml`.
pub fn profile_path(profile: Option<&str>) -> Result<PathBuf> {
    let name = profile.unwrap_or("config");
    let dirs = xdg::BaseDirectories::with_prefix("pipen").context("resolving XDG directories")?;
    Ok(dirs.get_config_home().join(format!("{name}.toml")))
}

/// Load a profile file, treating a missing file as an empty (all-default)
/// profile rather than an error.
pub fn load_profile_file(path: &Path) -> Result<ProfileFile> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("parsing profile {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProfileFile::default()),
        Err(e) => Err(e).with_context(|| format!("reading profile {}", path.display())),
    }
}

/// CLI-supplied overrides; every field is `Option` so only flags the user
/// actually passed take precedence over the lower layers.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub workdir: Option<PathBuf>,
    pub outdir: Option<PathBuf>,
    pub forks: Option<usize>,
    pub cache: Option<CachePolicy>,
    pub scheduler: Option<String>,
    pub loglevel: Option<String>,
    pub plugins: Option<Vec<String>>,
}

/// Merge the four layers: CLI > env > profile file > built-in default.
pub fn merge(profile: ProfileFile, env: EnvOverrides, cli: CliOverrides) -> Result<EngineConfig> {
    let default = EngineConfig::default();

    let loglevel_str = cli
        .loglevel
        .or(env.loglevel)
        .or(profile.loglevel);
    let loglevel = match loglevel_str {
        Some(s) => LogLevel::from_str(&s).map_err(|e| anyhow::anyhow!(e))?,
        None => default.loglevel,
    };

    Ok(EngineConfig {
        workdir: cli.workdir.or(env.workdir).or(profile.workdir).unwrap_or(default.workdir),
        outdir: cli.outdir.or(env.outdir).or(profile.outdir).unwrap_or(default.outdir),
        forks: cli.forks.or(env.forks).or(profile.forks).unwrap_or(default.forks),
        cache: cli.cache.or(profile.cache).unwrap_or(default.cache),
        scheduler: cli.scheduler.or(profile.scheduler).unwrap_or(default.scheduler),
        loglevel,
        plugins: cli.plugins.or(profile.plugins).unwrap_or(default.plugins),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_win_over_everything() {
        let profile = ProfileFile {
            forks: Some(4),
            ..Default::default()
        };
        let env = EnvOverrides {
            forks: Some(8),
            ..Default::default()
        };
        let cli = CliOverrides {
            forks: Some(16),
            ..Default::default()
        };
        let cfg = merge(profile, env, cli).unwrap();
        assert_eq!(cfg.forks, 16);
    }

    #[test]
    fn env_wins_over_profile_when_cli_absent() {
        let profile = ProfileFile {
            forks: Some(4),
            ..Default::default()
        };
        let env = EnvOverrides {
            forks: Some(8),
            ..Default::default()
        };
        let cfg = merge(profile, env, CliOverrides::default()).unwrap();
        assert_eq!(cfg.forks, 8);
    }

    #[test]
    fn falls_back_to_default_forks() {
        let cfg = merge(
            ProfileFile::default(),
            EnvOverrides::default(),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.forks, 1);
    }

    #[test]
    fn cache_force_and_true_are_distinct() {
        assert_eq!(CachePolicy::from_str("true").unwrap(), CachePolicy::True);
        assert_eq!(CachePolicy::from_str("force").unwrap(), CachePolicy::Force);
        assert_ne!(CachePolicy::from_str("true"), CachePolicy::from_str("force"));
    }

    #[test]
    fn missing_profile_file_is_not_an_error() {
        let profile = load_profile_file(Path::new("/nonexistent/pipen/config.toml")).unwrap();
        assert!(profile.workdir.is_none());
    }
}
