use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub erp: Erp,
    pub vendor: Vendor,
    #[serde(default)]
    pub expenses: Expenses,
    pub audit: Audit,
    #[serde(default)]
    pub notify: Notify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    #[serde(default)]
    pub debug_endpoints: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub data_dir: Option<String>,
    #[serde(default = "default_session_map_limit")]
    pub session_map_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Erp {
    pub base_url: String,
    #[serde(default = "default_data_timeout_ms")]
    pub data_timeout_ms: u64,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vendor {
    pub app_id: String,
    pub app_uid: String,
    pub secret_key: String,
    pub context_url: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expenses {
    #[serde(default = "default_dictionary_name")]
    pub dictionary_name: String,
    #[serde(default = "default_category")]
    pub default_category: String,
}

impl Default for Expenses {
    fn default() -> Self {
        Self {
            dictionary_name: default_dictionary_name(),
            default_category: default_category(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notify {
    pub kind: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default = "default_notify_api_base")]
    pub api_base: String,
}

impl Default for Notify {
    fn default() -> Self {
        Self {
            kind: "none".to_string(),
            bot_token: None,
            chat_id: None,
            api_base: default_notify_api_base(),
        }
    }
}

fn default_session_map_limit() -> usize {
    1000
}

fn default_data_timeout_ms() -> u64 {
    30_000
}

fn default_lookup_timeout_ms() -> u64 {
    10_000
}

fn default_token_ttl_secs() -> i64 {
    300
}

fn default_dictionary_name() -> String {
    "Категории расходов".to_string()
}

fn default_category() -> String {
    "Прочее".to_string()
}

fn default_notify_api_base() -> String {
    "https://api.telegram.org".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "json" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, json",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.data_dir.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.data_dir is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "json"
        && cfg
            .store
            .data_dir
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.data_dir is required when store.type=json".to_string(),
        ));
    }
    if cfg.store.session_map_limit == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "store.session_map_limit must be >= 1".to_string(),
        ));
    }
    if cfg.erp.data_timeout_ms == 0 || cfg.erp.lookup_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "erp timeouts must be >= 1".to_string(),
        ));
    }
    if cfg.vendor.token_ttl_secs <= 0 {
        return Err(ConfigError::UnsupportedConfig(
            "vendor.token_ttl_secs must be >= 1".to_string(),
        ));
    }
    match cfg.notify.kind.as_str() {
        "none" => {}
        "telegram" => {
            let missing = |v: &Option<String>| v.as_ref().map(|s| s.trim().is_empty()).unwrap_or(true);
            if missing(&cfg.notify.bot_token) || missing(&cfg.notify.chat_id) {
                return Err(ConfigError::UnsupportedConfig(
                    "notify.bot_token and notify.chat_id are required when notify.kind=telegram"
                        .to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "notify.kind={other} is not implemented; supported: none, telegram"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("costlink-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

erp:
  base_url: "https://api.moysklad.ru/api/remap/1.2"

vendor:
  app_id: "app-1"
  app_uid: "costlink.vendor"
  secret_key: "secret"
  context_url: "https://apps-api.moysklad.ru/api/vendor/1.0/context"

audit:
  jsonl_path: "./costlink-audit.jsonl"
"#
        .to_string()
    }

    #[test]
    fn applies_defaults_for_optional_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.store.session_map_limit, 1000);
        assert_eq!(cfg.erp.data_timeout_ms, 30_000);
        assert_eq!(cfg.erp.lookup_timeout_ms, 10_000);
        assert_eq!(cfg.vendor.token_ttl_secs, 300);
        assert_eq!(cfg.notify.kind, "none");
        assert_eq!(cfg.expenses.default_category, "Прочее");
        assert!(!cfg.server.debug_endpoints);
    }

    #[test]
    fn supports_json_store_type_with_dir() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"json\"\n  data_dir: \"./data\"",
        ));
        let cfg = load_and_validate(&path).expect("json config should be accepted");
        assert_eq!(cfg.store.kind, "json");
        assert_eq!(cfg.store.data_dir.as_deref(), Some("./data"));
    }

    #[test]
    fn rejects_json_store_without_dir() {
        let path = write_temp_config(&base_yaml().replace("type: \"memory\"", "type: \"json\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_telegram_without_credentials() {
        let path = write_temp_config(&(base_yaml() + "\nnotify:\n  kind: \"telegram\"\n"));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_session_map_limit() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  session_map_limit: 0",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }
}
