use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::GatewayConfig, validation::GatewayConfigValidator};

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML.
pub fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}

/// Load and validate; a configuration that does not validate is fatal at startup.
pub fn load_validated_config(config_path: &str) -> Result<GatewayConfig> {
    let config = load_config(config_path)?;
    GatewayConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
load_balance_mode: "weight"
default_url: "127.0.0.1:8081"
reverse_host:
  - service_name: "users"
  - service_name: "orders"
    load_balance_mode: "ip_hash"
etcd:
  endpoints: ["http://127.0.0.1:2379"]
  local_cache_default_expiration: 60
ip_table: ["10.1.1.1"]
restrictor:
  open: true
  rate: 100
  max_token: 200
  wait_time: 1
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_validated_config(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.reverse_host.len(), 2);
        assert_eq!(config.mode_for("orders"), "ip_hash");
        assert_eq!(config.mode_for("users"), "weight");
        assert_eq!(config.etcd.local_cache_default_expiration, 60);
        assert_eq!(config.etcd.local_cache_clean_up_time, 60);
        assert_eq!(config.restrictor.max_token, 200);
    }

    #[test]
    fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "reverse_host": [{ "service_name": "svc" }],
  "open_collector": true,
  "collector": { "switch": "es", "es": { "index": "transmit", "bulk_max_count": 50 } }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();
        assert!(config.open_collector);
        assert_eq!(config.collector.es.index, "transmit");
        assert_eq!(config.collector.es.bulk_max_count, 50);
        assert_eq!(config.collector.es.flush_interval, 5);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(
            temp_file,
            "reverse_host:\n  - service_name: svc\nload_balance_mode: fastest\n"
        )
        .unwrap();

        assert!(load_validated_config(temp_file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_starter_config_loads_and_ignores_legacy_keepalive_timeout() {
        let starter = include_str!("../../config.example.yaml");
        let legacy = starter.replace(
            "  dial_keepalive_time: 30\n",
            "  dial_keepalive_time: 30\n  dial_keepalive_timeout: 10\n",
        );
        assert_ne!(starter, legacy);

        for content in [starter, legacy.as_str()] {
            let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
            write!(temp_file, "{}", content).unwrap();

            let config = load_validated_config(temp_file.path().to_str().unwrap()).unwrap();
            assert_eq!(config.etcd.dial_keepalive_time, 30);
            assert_eq!(config.route_cache.clean_up_interval, 10);
        }
    }
}
