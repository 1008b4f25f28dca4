use std::path::Path;

use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};

/// Locate, load and validate the configuration.
///
/// The explicit path wins, then `RELAYKIT_CONFIG_PATH`, then `config.yaml` in
/// the working directory. A named file (explicit or from the environment)
/// must exist. Without any file only defaults and environment variables
/// apply.
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let named_path = explicit_path
        .map(str::to_string)
        .or_else(|| std::env::var("RELAYKIT_CONFIG_PATH").ok());

    if let Some(path) = &named_path {
        if !Path::new(path).exists() {
            return Err(Error::Config(config::ConfigError::Message(format!(
                "configuration file {path} does not exist"
            ))));
        }
    }

    let config_path = named_path.or_else(|| {
        let cwd = "config.yaml";
        Path::new(cwd).exists().then(|| cwd.to_string())
    });

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env()?
        }
    };

    config.validate().map_err(Error::Validation)?;

    info!(
        listen_address = %config.server.listen_address,
        broker_addresses = ?config.pubsub.addresses,
        "Configuration loaded and validated successfully"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "pubsub:\n  default_topic: \"\"").unwrap();

        let err = load_config(Some(file.path().to_str().unwrap())).unwrap_err();
        match err {
            Error::Validation(errors) => {
                assert!(errors.iter().any(|e| e.contains("default_topic")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_config_rejects_missing_explicit_file() {
        let err = load_config(Some("/nonexistent/relaykit-prod.yaml")).unwrap_err();
        match err {
            Error::Config(e) => assert!(e.to_string().contains("relaykit-prod.yaml")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_config_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "server:\n  listen_address: \"127.0.0.1:9000\"").unwrap();

        let config = load_config(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.server.listen_address, "127.0.0.1:9000");
    }
}
