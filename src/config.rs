use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::Path,
};

use tokio::fs;
use tracing::debug;

pub mod schema;

pub use schema::{Config, RelayConfig};

#[derive(Debug)]
pub enum ConfigError {
    Read(io::Error),
    Parse(toml::de::Error),
    Invalid(&'static str),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(_) => write!(f, "unable to read configuration file"),
            ConfigError::Parse(_) => write!(f, "unable to parse configuration file"),
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Read(error) => Some(error),
            ConfigError::Parse(error) => Some(error),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Read and validate the configuration file at `path`.
#[tracing::instrument(err)]
pub async fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).await.map_err(ConfigError::Read)?;
    let config = parse(&contents)?;

    debug!(?config, "configuration parsed");

    Ok(config)
}

pub fn parse(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(contents).map_err(ConfigError::Parse)?;
    config.validate()?;

    Ok(config)
}
