use std::path::PathBuf;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:1323").
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// Root directory holding every job directory. Created if absent.
    #[serde(default = "default_data_dir")]
    #[garde(custom(non_empty_path))]
    pub data_dir: PathBuf,

    /// Recognition engine executable.
    #[serde(default = "default_audiveris_bin")]
    #[garde(custom(non_empty_path))]
    pub audiveris_bin: PathBuf,

    /// Score conversion engine executable.
    #[serde(default = "default_mscore_bin")]
    #[garde(custom(non_empty_path))]
    pub mscore_bin: PathBuf,

    /// Wall-clock budget for a whole conversion pipeline run.
    #[serde(default = "default_pipeline_timeout_secs")]
    #[garde(range(min = 1, max = 3600))]
    pub pipeline_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:1323".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_audiveris_bin() -> PathBuf {
    PathBuf::from("/audiveris-extract/bin/Audiveris")
}

fn default_mscore_bin() -> PathBuf {
    PathBuf::from("mscore")
}

fn default_pipeline_timeout_secs() -> u64 {
    300
}

fn non_empty_path(value: &PathBuf, _ctx: &()) -> garde::Result {
    if value.as_os_str().is_empty() {
        return Err(garde::Error::new("path must not be empty"));
    }
    Ok(())
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit set of variables (upper-case names, as in the environment).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: AppConfig = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }

    /// Create the data root if needed and return its absolute path.
    pub async fn prepare_data_dir(&self) -> Result<PathBuf, ConfigError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| ConfigError::DataDir(self.data_dir.clone(), e))?;
        tokio::fs::canonicalize(&self.data_dir)
            .await
            .map_err(|e| ConfigError::DataDir(self.data_dir.clone(), e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Cannot prepare data directory {0:?}: {1}")]
    DataDir(PathBuf, #[source] std::io::Error),
}
