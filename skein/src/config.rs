//! Configuration for the workspace skein operates within and options for
//! tweaking skein's own behavior.
//!
//! Options resolve in two layers. `ConfigBuilder` is the partial view: the
//! shape of `.skein.toml`, where every knob is optional, with command-line
//! flags layered on top of whatever the file set. `resolve()` consumes the
//! builder into a `Config` whose fields are all concrete; defaults are
//! filled in there and nowhere else, so a value the user wrote -- in the
//! file or as a flag -- can never be clobbered by one the tool made up.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context as _, Result};
use serde_derive::Deserialize;
use url::Url;

use skein_data::HashFunction;

/// Name of the workspace configuration file.
pub const CONFIG_FILE: &str = ".skein.toml";

/// How source files are brought into the execution root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingMode {
    Copy,
    Hardlink,
    Symlink,
}

/// The partially-specified option set: what the file and the flags actually
/// said, nothing more. Deserializes straight from `.skein.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigBuilder {
    keep_going: Option<bool>,
    jobs: Option<usize>,
    disk_cache: Option<PathBuf>,
    remote_cache: Option<String>,
    repository_disable_download: Option<bool>,
    experimental_sibling_repository_layout: Option<bool>,
    hash_function: Option<HashFunction>,
    options: BTreeMap<String, String>,
    action_env: Option<Vec<String>>,
    action_timeout_secs: Option<u64>,
    io_retries: Option<u32>,
    io_retry_base_ms: Option<u64>,
    remote_ttl_secs: Option<u64>,
    staging: Option<StagingMode>,
}

impl ConfigBuilder {
    /// Reads `.skein.toml` from the workspace root. A missing file is an
    /// empty builder.
    pub fn from_workspace(workspace_root: &Path) -> Result<ConfigBuilder> {
        let path = workspace_root.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(ConfigBuilder::default());
        }
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Applies one `--flag` or `--flag=value` override on top of whatever
    /// the file specified. Returns false for flags this builder does not
    /// know.
    pub fn apply_flag(&mut self, flag: &str) -> Result<bool> {
        let (name, value) = match flag.find('=') {
            Some(idx) => (&flag[..idx], Some(&flag[idx + 1..])),
            None => (flag, None),
        };
        match name {
            "--keep-going" | "-k" => self.keep_going = Some(true),
            "--jobs" => {
                let v = value.ok_or_else(|| anyhow!("--jobs requires a value"))?;
                let jobs = usize::from_str(v).map_err(|_| anyhow!("bad --jobs value `{}`", v))?;
                if jobs == 0 {
                    return Err(anyhow!("--jobs must be positive"));
                }
                self.jobs = Some(jobs);
            }
            "--disk_cache" => {
                let v = value.ok_or_else(|| anyhow!("--disk_cache requires a path"))?;
                self.disk_cache = Some(PathBuf::from(v));
            }
            "--remote_cache" => {
                let v = value.ok_or_else(|| anyhow!("--remote_cache requires a URL"))?;
                validate_remote_url(v)?;
                self.remote_cache = Some(v.to_owned());
            }
            "--repository_disable_download" => self.repository_disable_download = Some(true),
            "--experimental_sibling_repository_layout" => {
                self.experimental_sibling_repository_layout = Some(true);
            }
            "--define" => {
                let v = value.ok_or_else(|| anyhow!("--define requires KEY=VALUE"))?;
                let (k, val) = v
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--define requires KEY=VALUE, got `{}`", v))?;
                self.options.insert(k.to_owned(), val.to_owned());
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Consumes the builder into the resolved configuration. Anything left
    /// unset gets its default here: the worker count from the CPU count, the
    /// cache location under the workspace's output base.
    pub fn resolve(self, workspace_root: &Path) -> Result<Config> {
        if let Some(remote) = &self.remote_cache {
            validate_remote_url(remote)?;
        }
        let jobs = match self.jobs {
            Some(0) => return Err(anyhow!("jobs must be positive")),
            Some(n) => n,
            None => num_cpus::get(),
        };
        Ok(Config {
            keep_going: self.keep_going.unwrap_or(false),
            jobs,
            disk_cache: self.disk_cache.unwrap_or_else(|| {
                workspace_root.join(crate::workspace::OUTPUT_BASE).join("cache")
            }),
            remote_cache: self.remote_cache,
            repository_disable_download: self.repository_disable_download.unwrap_or(false),
            experimental_sibling_repository_layout: self
                .experimental_sibling_repository_layout
                .unwrap_or(false),
            hash_function: self.hash_function.unwrap_or_default(),
            options: self.options,
            action_env: self
                .action_env
                .unwrap_or_else(|| vec!["PATH".to_owned(), "HOME".to_owned()]),
            action_timeout_secs: self.action_timeout_secs,
            io_retries: self.io_retries.unwrap_or(3),
            io_retry_base_ms: self.io_retry_base_ms.unwrap_or(100),
            remote_ttl_secs: self.remote_ttl_secs,
            staging: self.staging.unwrap_or(StagingMode::Copy),
        })
    }
}

fn validate_remote_url(remote: &str) -> Result<()> {
    let url = Url::parse(remote)
        .map_err(|e| anyhow!("invalid --remote_cache URL `{}`: {}", remote, e))?;
    match url.scheme() {
        "mem" | "grpc" | "grpcs" | "http" | "https" => Ok(()),
        other => Err(anyhow!("unsupported remote cache scheme `{}`", other)),
    }
}

/// Fully-resolved skein options: every field concrete. Built once per
/// invocation through `ConfigBuilder::resolve`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Continue building independent targets after a failure.
    pub keep_going: bool,
    /// Worker threads.
    pub jobs: usize,
    /// Action cache location.
    pub disk_cache: PathBuf,
    /// Remote cache endpoint URL; the scheme selects the transport.
    pub remote_cache: Option<String>,
    /// Refuse to fetch external repositories.
    pub repository_disable_download: bool,
    /// Lay external workspaces out as siblings of the main execution root.
    pub experimental_sibling_repository_layout: bool,
    pub hash_function: HashFunction,
    /// Build configuration options (the top configuration's contents).
    pub options: BTreeMap<String, String>,
    /// Client env vars actions may declare and receive.
    pub action_env: Vec<String>,
    pub action_timeout_secs: Option<u64>,
    /// Bounded exponential backoff for I/O and remote transport errors.
    pub io_retries: u32,
    pub io_retry_base_ms: u64,
    /// TTL stamped on entries uploaded to the remote cache.
    pub remote_ttl_secs: Option<u64>,
    pub staging: StagingMode,
}

impl Config {
    /// The workspace file's options resolved against `workspace_root`, with
    /// no flag overrides.
    pub fn load(workspace_root: &Path) -> Result<Config> {
        ConfigBuilder::from_workspace(workspace_root)?.resolve(workspace_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_builder_resolves_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(config.jobs >= 1);
        assert!(config.disk_cache.ends_with(".skein/cache"));
        assert!(!config.keep_going);
        assert_eq!(config.io_retries, 3);
        assert_eq!(config.staging, StagingMode::Copy);
    }

    #[test]
    fn file_values_survive_resolution() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
            keep_going = true
            jobs = 3
            [options]
            mode = "opt"
            "#,
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(config.keep_going);
        assert_eq!(config.jobs, 3);
        assert_eq!(config.options.get("mode").unwrap(), "opt");
        // Unset knobs still default.
        assert!(config.disk_cache.ends_with(".skein/cache"));
    }

    #[test]
    fn flags_override_the_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "jobs = 3\n").unwrap();
        let mut builder = ConfigBuilder::from_workspace(dir.path()).unwrap();
        assert!(builder.apply_flag("--jobs=7").unwrap());
        assert!(builder.apply_flag("--keep-going").unwrap());
        assert!(builder.apply_flag("--define=cpu=arm").unwrap());
        assert!(!builder.apply_flag("--unknown").unwrap());
        assert!(builder.apply_flag("--jobs=zero").is_err());
        let config = builder.resolve(dir.path()).unwrap();
        assert_eq!(config.jobs, 7);
        assert!(config.keep_going);
        assert_eq!(config.options.get("cpu").unwrap(), "arm");
    }

    #[test]
    fn zero_jobs_in_the_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "jobs = 0\n").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }

    #[test]
    fn remote_cache_url_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = ConfigBuilder::from_workspace(dir.path()).unwrap();
        assert!(builder.apply_flag("--remote_cache=grpc://cache.example:9092").is_ok());
        assert!(builder.apply_flag("--remote_cache=not a url").is_err());
        assert!(builder.apply_flag("--remote_cache=ftp://cache.example").is_err());
    }
}
