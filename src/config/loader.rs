use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::ProxyConfig, validation::ProxyConfigValidator};

/// Load and validate configuration from a file using the config crate.
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<ProxyConfig> {
    let config = load_config_sync(config_path)?;
    ProxyConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Load configuration synchronously, without validation.
///
/// Values may be overridden through `TRUNKLINE__`-prefixed environment
/// variables (e.g. `TRUNKLINE__MAINTENANCE__ENABLED=true`).
pub fn load_config_sync(config_path: &str) -> Result<ProxyConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Toml, // Default to TOML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(Environment::with_prefix("TRUNKLINE").separator("__"))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let proxy_config: ProxyConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(proxy_config)
}

/// Load configuration without validation (used for the validate command)
pub async fn load_config_unchecked(config_path: &str) -> Result<ProxyConfig> {
    load_config_sync(config_path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::TargetConfig;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
[transaction]
timeout = "8s"

[trunks.pstn.target]
type = "static"
destinations = [
  { uri = "sip:10.0.0.1:5060", preference = 0.5 },
  { uri = "sip:10.0.0.2:5060" },
]

[trunks.pstn]
failover_codes = [500, 503]
error_mapping = "carrier"

[[error_mappings]]
name = "carrier"
rules = [{ codes = [500, 503], code = 480, phrase = "Temporarily Unavailable" }]
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.transaction_timeout(), std::time::Duration::from_secs(8));
        let trunk = config.trunks.get("pstn").unwrap();
        match &trunk.target {
            TargetConfig::Static { destinations } => {
                assert_eq!(destinations.len(), 2);
                assert_eq!(destinations[1].preference, 1.0);
            }
            other => panic!("unexpected target: {other:?}"),
        }
        assert_eq!(trunk.failover_codes, Some(vec![500, 503]));
        assert_eq!(config.error_mappings.len(), 1);
    }

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
trunks:
  carrier:
    target:
      type: resolve
      name: carrier.example.net
      transport: tcp
    routing_hint: carrier-a
routes:
  - pattern: "^sip:\\+1"
    trunk: carrier
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.routes.len(), 1);
        assert_eq!(
            config.trunks.get("carrier").unwrap().routing_hint.as_deref(),
            Some("carrier-a")
        );
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_config() {
        let toml_content = r#"
[trunks.bad.target]
type = "static"
destinations = [{ uri = "sip:10.0.0.1", preference = 2.0 }]
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let path = temp_file.path().to_str().unwrap();
        assert!(load_config(path).await.is_err());
        // The unchecked loader still parses it
        assert!(load_config_unchecked(path).await.is_ok());
    }
}
