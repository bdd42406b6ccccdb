/// `load_config` module: loads the YAML fleet description into the core [`FleetConfig`].
///
/// This module is the only place where user-supplied YAML is parsed.
///
/// # Responsibilities
/// - Parse the fleet file (output directory, artifacts, environments and their platforms)
/// - Resolve relative artifact and env-file paths against the config file's directory
/// - Reject configurations the orchestrator cannot run (no environments, duplicate names)
///
/// # Example
/// ```yaml
/// output_dir: ./fleet-output
/// artifacts:
///   binary: ./bin/cf
///   driver: ./scripts/collect.sh
/// environments:
///   - name: jumpbox-east
///     host: 10.0.0.12
///     user: ops
///     auth: { type: key, path: ~/.ssh/id_ed25519 }
///     workdir: /data/scratch
///     platforms:
///       - name: cf-east
///         api: https://api.sys.east.example.com
///         env: { FOUNDATION: east }
/// ```
///
/// # Errors
/// All errors use `anyhow::Error` and surface at the CLI boundary.
use anyhow::{bail, Result};
use cf_inventory_core::config::{ArtifactConfig, AuthMethod, EnvironmentConfig, FleetConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_output_dir")]
    output_dir: PathBuf,
    artifacts: ArtifactConfig,
    #[serde(default)]
    environments: Vec<EnvironmentConfig>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./fleet-output")
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    if let (Ok(rest), Some(home)) = (path.strip_prefix("~"), std::env::var_os("HOME")) {
        return PathBuf::from(home).join(rest);
    }
    base.join(path)
}

fn validate(config: &FleetConfig) -> Result<()> {
    if config.environments.is_empty() {
        bail!("config defines no environments");
    }
    let mut env_names = HashSet::new();
    for env in &config.environments {
        if !env_names.insert(env.name.as_str()) {
            bail!("environment '{}' is defined twice", env.name);
        }
        let mut platform_names = HashSet::new();
        for platform in &env.platforms {
            if !platform_names.insert(platform.name.as_str()) {
                bail!(
                    "platform '{}' is defined twice in environment '{}'",
                    platform.name,
                    env.name
                );
            }
            if platform.name.contains('/') || platform.name.is_empty() {
                bail!("platform name '{}' is not usable as a directory name", platform.name);
            }
        }
        if env.platforms.is_empty() {
            warn!(environment = %env.name, "Environment has no platforms; nothing will run there");
        }
        if let AuthMethod::Password { env: var } = &env.auth {
            if std::env::var_os(var).is_none() {
                warn!(environment = %env.name, variable = %var, "Password variable is not set");
            }
        }
    }
    Ok(())
}

/// Loads the fleet YAML file and returns the validated core configuration.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<FleetConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let raw: RawConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    let base = path_ref.parent().unwrap_or_else(|| Path::new("."));
    let mut environments = raw.environments;
    for env in &mut environments {
        if let AuthMethod::Key { path } = &mut env.auth {
            let resolved = resolve(base, path);
            *path = resolved;
        }
        for platform in &mut env.platforms {
            if let Some(env_file) = &mut platform.env_file {
                let resolved = resolve(base, env_file);
                *env_file = resolved;
            }
        }
    }
    let config = FleetConfig {
        output_dir: raw.output_dir,
        artifacts: ArtifactConfig {
            binary: resolve(base, &raw.artifacts.binary),
            driver: resolve(base, &raw.artifacts.driver),
            verify_args: raw.artifacts.verify_args,
        },
        environments,
    };

    if let Err(e) = validate(&config) {
        error!(error = %e, config_path = ?path_ref, "Config validation failed");
        return Err(e);
    }
    config.trace_loaded();
    Ok(config)
}
