use crate::models::{Pair, TlsConfiguration};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use config::{Config as SettingsLoader, Environment};
use serde::Deserialize;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

/// Endpoint registered at first start when the store holds no endpoint yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialEndpointConfig {
    pub url: String,
    pub tls: TlsConfiguration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub auth_disabled: bool,
    pub jwt_secret: Option<String>,
    pub admin_username: Option<String>,
    pub endpoint_management: bool,
    pub initial_endpoint: Option<InitialEndpointConfig>,
    pub hidden_labels: Vec<Pair>,
    pub azure_login_url: String,
    pub docker_binary: String,
    pub max_body_size: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawEnvConfig {
    config: Option<String>,
    config_base64: Option<String>,
    bind: Option<String>,
    data_dir: Option<String>,
    log_level: Option<String>,
    no_auth: Option<String>,
    jwt_secret: Option<String>,
    admin_username: Option<String>,
    endpoint_management: Option<String>,
    host: Option<String>,
    tls_verify: Option<String>,
    tls_skip_verify: Option<String>,
    tls_cacert: Option<String>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
    hide_labels: Option<String>,
    azure_login_url: Option<String>,
    docker_binary: Option<String>,
    max_body_size: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let env_cfg = load_berth_env()?;
        let mut cfg = Self::defaults();
        cfg.apply_env_config_sources_if_present(&env_cfg)?;
        cfg.apply_env_overrides(&env_cfg)?;
        cfg.apply_port_override(load_process_env_value("port")?);
        Ok(cfg)
    }

    pub fn from_env_with_config_file(config_path: PathBuf) -> Result<Self, String> {
        let env_cfg = load_berth_env()?;
        let mut cfg = Self::defaults();
        cfg.apply_env_config_sources_if_present(&env_cfg)?;
        cfg.apply_yaml_overrides(Self::from_yaml_file(config_path)?);
        cfg.apply_env_overrides(&env_cfg)?;
        cfg.apply_port_override(load_process_env_value("port")?);
        Ok(cfg)
    }

    pub fn defaults() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9000)),
            data_dir: PathBuf::from(".berth-data"),
            log_level: "info".to_string(),
            auth_disabled: false,
            jwt_secret: None,
            admin_username: None,
            endpoint_management: true,
            initial_endpoint: None,
            hidden_labels: Vec::new(),
            azure_login_url: crate::constants::AZURE_LOGIN_URL.to_string(),
            docker_binary: "docker".to_string(),
            max_body_size: 50 * 1024 * 1024,
        }
    }

    fn apply_env_config_sources_if_present(
        &mut self,
        env_cfg: &RawEnvConfig,
    ) -> Result<(), String> {
        let config_path = env_cfg
            .config
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let config_b64 = env_cfg
            .config_base64
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match (config_path, config_b64) {
            (Some(_), Some(_)) => {
                Err("BERTH_CONFIG and BERTH_CONFIG_BASE64 are both set; use only one".to_string())
            }
            (Some(path), None) => {
                let loaded = Self::from_yaml_file(PathBuf::from(path))
                    .map_err(|err| format!("failed to load BERTH_CONFIG={path}: {err}"))?;
                self.apply_yaml_overrides(loaded);
                Ok(())
            }
            (None, Some(value)) => {
                let compact = value
                    .chars()
                    .filter(|ch| !ch.is_ascii_whitespace())
                    .collect::<String>();
                let decoded = B64
                    .decode(compact)
                    .map_err(|err| format!("failed to decode BERTH_CONFIG_BASE64: {err}"))?;
                let yaml = String::from_utf8(decoded).map_err(|err| {
                    format!("failed to decode BERTH_CONFIG_BASE64: decoded bytes are not UTF-8 ({err})")
                })?;
                let loaded = Self::from_yaml_str("BERTH_CONFIG_BASE64", &yaml)
                    .map_err(|err| format!("failed to load BERTH_CONFIG_BASE64: {err}"))?;
                self.apply_yaml_overrides(loaded);
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    fn apply_env_overrides(&mut self, env_cfg: &RawEnvConfig) -> Result<(), String> {
        if let Some(bind) = parse_env_value::<SocketAddr>(env_cfg.bind.as_deref()) {
            self.bind = bind;
        }
        if let Some(raw_data_dir) = env_cfg.data_dir.as_deref() {
            self.data_dir = PathBuf::from(raw_data_dir);
        }
        if let Some(value) = env_cfg.log_level.as_deref()
            && !value.trim().is_empty()
        {
            self.log_level = value.to_string();
        }
        if let Some(parsed) = parse_env_value::<bool>(env_cfg.no_auth.as_deref()) {
            self.auth_disabled = parsed;
        }
        if let Some(value) = env_cfg.jwt_secret.as_deref() {
            self.jwt_secret = empty_string_to_none(value.to_string());
        }
        if let Some(value) = env_cfg.admin_username.as_deref() {
            self.admin_username = empty_string_to_none(value.trim().to_string());
        }
        if let Some(parsed) = parse_env_value::<bool>(env_cfg.endpoint_management.as_deref()) {
            self.endpoint_management = parsed;
        }
        if let Some(value) = env_cfg.hide_labels.as_deref() {
            self.hidden_labels = parse_label_pairs(value)?;
        }
        if let Some(value) = env_cfg.azure_login_url.as_deref()
            && !value.trim().is_empty()
        {
            self.azure_login_url = value.trim().trim_end_matches('/').to_string();
        }
        if let Some(value) = env_cfg.docker_binary.as_deref()
            && !value.trim().is_empty()
        {
            self.docker_binary = value.to_string();
        }
        if let Some(value) = env_cfg.max_body_size.as_deref()
            && let Some(parsed) = parse_body_size(value)
        {
            self.max_body_size = parsed;
        }

        self.apply_endpoint_env_overrides(env_cfg)
    }

    fn apply_endpoint_env_overrides(&mut self, env_cfg: &RawEnvConfig) -> Result<(), String> {
        if let Some(host) = env_cfg.host.as_deref() {
            let host = host.trim();
            if host.is_empty() {
                self.initial_endpoint = None;
            } else {
                validate_endpoint_url(host)?;
                let tls = self
                    .initial_endpoint
                    .take()
                    .map(|endpoint| endpoint.tls)
                    .unwrap_or_default();
                self.initial_endpoint = Some(InitialEndpointConfig {
                    url: host.to_string(),
                    tls,
                });
            }
        }

        let Some(endpoint) = self.initial_endpoint.as_mut() else {
            return Ok(());
        };
        if let Some(parsed) = parse_env_value::<bool>(env_cfg.tls_verify.as_deref()) {
            endpoint.tls.tls = parsed;
        }
        if let Some(parsed) = parse_env_value::<bool>(env_cfg.tls_skip_verify.as_deref()) {
            endpoint.tls.tls_skip_verify = parsed;
            if parsed {
                endpoint.tls.tls = true;
            }
        }
        if let Some(value) = env_cfg.tls_cacert.as_deref() {
            endpoint.tls.tls_ca_cert_path = empty_string_to_none(value.to_string());
        }
        if let Some(value) = env_cfg.tls_cert.as_deref() {
            endpoint.tls.tls_cert_path = empty_string_to_none(value.to_string());
        }
        if let Some(value) = env_cfg.tls_key.as_deref() {
            endpoint.tls.tls_key_path = empty_string_to_none(value.to_string());
        }
        Ok(())
    }

    fn apply_port_override(&mut self, port_value: Option<String>) {
        // PaaS compatibility: honor injected PORT and force a public bind address.
        if let Some(port) = parse_env_value::<u16>(port_value.as_deref()) {
            self.bind = SocketAddr::from(([0, 0, 0, 0], port));
        }
    }

    fn apply_yaml_overrides(&mut self, loaded: Self) {
        self.bind = loaded.bind;
        self.data_dir = loaded.data_dir;
        self.log_level = loaded.log_level;
        self.auth_disabled = loaded.auth_disabled;
        self.jwt_secret = loaded.jwt_secret;
        self.admin_username = loaded.admin_username;
        self.endpoint_management = loaded.endpoint_management;
        self.initial_endpoint = loaded.initial_endpoint;
        self.hidden_labels = loaded.hidden_labels;
        self.azure_login_url = loaded.azure_login_url;
        self.docker_binary = loaded.docker_binary;
        self.max_body_size = loaded.max_body_size;
    }

    pub fn from_yaml_file(path: PathBuf) -> Result<Self, String> {
        let parsed = load_yaml_config(&path)?;
        Self::from_yaml_config(parsed)
    }

    fn from_yaml_str(source: &str, text: &str) -> Result<Self, String> {
        let parsed = serde_yaml::from_str::<YamlConfig>(text)
            .map_err(|err| format!("failed to parse {source}: {err}"))?;
        Self::from_yaml_config(parsed)
    }

    fn from_yaml_config(parsed: YamlConfig) -> Result<Self, String> {
        let defaults = Self::defaults();
        let bind = match parsed.listen.as_deref() {
            Some(listen) => listen
                .parse()
                .map_err(|err| format!("invalid listen address '{listen}': {err}"))?,
            None => defaults.bind,
        };
        let max_body_size = parsed
            .max_body_size
            .as_deref()
            .and_then(parse_body_size)
            .unwrap_or(defaults.max_body_size);
        let log_level = parsed
            .log
            .and_then(|log| log.level)
            .unwrap_or(defaults.log_level);

        let auth = parsed.auth.unwrap_or_default();
        let endpoints = parsed.endpoints.unwrap_or_default();
        let initial_endpoint = match endpoints.host {
            Some(host) if !host.trim().is_empty() => {
                validate_endpoint_url(host.trim())?;
                let tls = endpoints.tls.unwrap_or_default();
                Some(InitialEndpointConfig {
                    url: host.trim().to_string(),
                    tls: TlsConfiguration {
                        tls: tls.enabled.unwrap_or(false) || tls.skip_verify.unwrap_or(false),
                        tls_skip_verify: tls.skip_verify.unwrap_or(false),
                        tls_ca_cert_path: tls.ca_cert,
                        tls_cert_path: tls.cert,
                        tls_key_path: tls.key,
                    },
                })
            }
            _ => None,
        };

        let mut hidden_labels = Vec::new();
        for entry in parsed.hidden_labels.unwrap_or_default() {
            hidden_labels.push(match entry {
                YamlLabel::Pair { name, value } => Pair { name, value },
                YamlLabel::Text(text) => parse_label_pair(&text)?,
            });
        }

        Ok(Self {
            bind,
            data_dir: parsed.data.map(PathBuf::from).unwrap_or(defaults.data_dir),
            log_level,
            auth_disabled: auth.enabled.is_some_and(|enabled| !enabled),
            jwt_secret: auth.jwt_secret.and_then(empty_string_to_none),
            admin_username: auth.admin_username.and_then(empty_string_to_none),
            endpoint_management: endpoints.management.unwrap_or(true),
            initial_endpoint,
            hidden_labels,
            azure_login_url: parsed
                .azure
                .and_then(|azure| azure.login_url)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.azure_login_url),
            docker_binary: parsed
                .stacks
                .and_then(|stacks| stacks.docker_binary)
                .unwrap_or(defaults.docker_binary),
            max_body_size,
        })
    }
}

fn load_yaml_config(path: &Path) -> Result<YamlConfig, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    serde_yaml::from_str::<YamlConfig>(&text)
        .map_err(|err| format!("failed to parse {}: {err}", path.display()))
}

fn load_berth_env() -> Result<RawEnvConfig, String> {
    let settings = SettingsLoader::builder()
        .add_source(Environment::with_prefix("BERTH").try_parsing(false))
        .build()
        .map_err(|err| format!("failed to load BERTH_* environment: {err}"))?;

    Ok(RawEnvConfig {
        config: env_value_for_var(&settings, "BERTH_CONFIG"),
        config_base64: env_value_for_var(&settings, "BERTH_CONFIG_BASE64"),
        bind: env_value_for_var(&settings, "BERTH_BIND"),
        data_dir: env_value_for_var(&settings, "BERTH_DATA_DIR"),
        log_level: env_value_for_var(&settings, "BERTH_LOG_LEVEL"),
        no_auth: env_value_for_var(&settings, "BERTH_NO_AUTH"),
        jwt_secret: env_value_for_var(&settings, "BERTH_JWT_SECRET"),
        admin_username: env_value_for_var(&settings, "BERTH_ADMIN_USERNAME"),
        endpoint_management: env_value_for_var(&settings, "BERTH_ENDPOINT_MANAGEMENT"),
        host: env_value_for_var(&settings, "BERTH_HOST"),
        tls_verify: env_value_for_var(&settings, "BERTH_TLS_VERIFY"),
        tls_skip_verify: env_value_for_var(&settings, "BERTH_TLS_SKIP_VERIFY"),
        tls_cacert: env_value_for_var(&settings, "BERTH_TLS_CACERT"),
        tls_cert: env_value_for_var(&settings, "BERTH_TLS_CERT"),
        tls_key: env_value_for_var(&settings, "BERTH_TLS_KEY"),
        hide_labels: env_value_for_var(&settings, "BERTH_HIDE_LABELS"),
        azure_login_url: env_value_for_var(&settings, "BERTH_AZURE_LOGIN_URL"),
        docker_binary: env_value_for_var(&settings, "BERTH_DOCKER_BINARY"),
        max_body_size: env_value_for_var(&settings, "BERTH_MAX_BODY_SIZE"),
    })
}

fn load_process_env_value(key: &str) -> Result<Option<String>, String> {
    let settings = SettingsLoader::builder()
        .add_source(Environment::default().try_parsing(false))
        .build()
        .map_err(|err| format!("failed to load process environment: {err}"))?;
    Ok(env_value(&settings, key))
}

fn env_value(settings: &SettingsLoader, key: &str) -> Option<String> {
    settings
        .get_string(key)
        .ok()
        .or_else(|| settings.get_string(&key.to_ascii_uppercase()).ok())
}

fn env_value_for_var(settings: &SettingsLoader, env_var: &str) -> Option<String> {
    let key = env_var
        .strip_prefix("BERTH_")
        .unwrap_or(env_var)
        .to_ascii_lowercase();
    env_value(settings, &key)
}

fn parse_env_value<T>(raw: Option<&str>) -> Option<T>
where
    T: std::str::FromStr,
{
    raw.and_then(|value| value.trim().parse::<T>().ok())
}

fn empty_string_to_none(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

/// Endpoint URLs are either `unix://` sockets or `tcp://` addresses.
pub fn validate_endpoint_url(url: &str) -> Result<(), String> {
    if url.starts_with("unix://") || url.starts_with("tcp://") {
        Ok(())
    } else {
        Err(format!(
            "invalid endpoint url '{url}': must start with unix:// or tcp://"
        ))
    }
}

pub fn parse_label_pair(raw: &str) -> Result<Pair, String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok(Pair {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        }),
        _ => Err(format!("invalid label '{raw}': expected name=value")),
    }
}

fn parse_label_pairs(raw: &str) -> Result<Vec<Pair>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(parse_label_pair)
        .collect()
}

fn parse_body_size(raw: &str) -> Option<usize> {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    let idx = value
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    if idx == 0 {
        return None;
    }
    let n = value[..idx].parse::<usize>().ok()?;
    let multiplier = match value[idx..].trim() {
        "" | "b" => 1usize,
        "kb" => 1024usize,
        "mb" => 1024usize * 1024,
        "gb" => 1024usize * 1024 * 1024,
        _ => return None,
    };
    n.checked_mul(multiplier)
}

#[derive(Debug, Deserialize)]
struct YamlConfig {
    listen: Option<String>,
    data: Option<String>,
    log: Option<YamlLog>,
    auth: Option<YamlAuth>,
    endpoints: Option<YamlEndpoints>,
    #[serde(rename = "hiddenLabels")]
    hidden_labels: Option<Vec<YamlLabel>>,
    azure: Option<YamlAzure>,
    stacks: Option<YamlStacks>,
    #[serde(rename = "maxBodySize")]
    max_body_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YamlLog {
    level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct YamlAuth {
    enabled: Option<bool>,
    #[serde(rename = "jwtSecret")]
    jwt_secret: Option<String>,
    #[serde(rename = "adminUsername")]
    admin_username: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct YamlEndpoints {
    management: Option<bool>,
    host: Option<String>,
    tls: Option<YamlTls>,
}

#[derive(Debug, Deserialize, Default)]
struct YamlTls {
    enabled: Option<bool>,
    #[serde(rename = "skipVerify")]
    skip_verify: Option<bool>,
    #[serde(rename = "caCert")]
    ca_cert: Option<String>,
    cert: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YamlLabel {
    Pair { name: String, value: String },
    Text(String),
}

#[derive(Debug, Deserialize)]
struct YamlAzure {
    #[serde(rename = "loginUrl")]
    login_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YamlStacks {
    #[serde(rename = "dockerBinary")]
    docker_binary: Option<String>,
}
