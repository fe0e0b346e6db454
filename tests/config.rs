use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use berth::config::Config;
use std::{collections::HashSet, io::Write, sync::Mutex};

static ENV_LOCK: Mutex<()> = Mutex::new(());

const BERTH_VARS: &[&str] = &[
    "BERTH_CONFIG",
    "BERTH_CONFIG_BASE64",
    "BERTH_BIND",
    "BERTH_DATA_DIR",
    "BERTH_LOG_LEVEL",
    "BERTH_NO_AUTH",
    "BERTH_JWT_SECRET",
    "BERTH_ADMIN_USERNAME",
    "BERTH_ENDPOINT_MANAGEMENT",
    "BERTH_HOST",
    "BERTH_TLS_VERIFY",
    "BERTH_TLS_SKIP_VERIFY",
    "BERTH_TLS_CACERT",
    "BERTH_TLS_CERT",
    "BERTH_TLS_KEY",
    "BERTH_HIDE_LABELS",
    "BERTH_AZURE_LOGIN_URL",
    "BERTH_DOCKER_BINARY",
    "BERTH_MAX_BODY_SIZE",
    "PORT",
];

#[test]
fn from_env_with_config_file_loads_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
listen: 127.0.0.1:4999
endpoints:
  host: unix:///var/run/docker.sock
hiddenLabels:
  - "internal=true"
"#
    )
    .expect("write");

    with_env_vars(&[], || {
        let cfg = Config::from_env_with_config_file(file.path().to_path_buf()).expect("parse");
        assert_eq!(cfg.bind.to_string(), "127.0.0.1:4999");
        assert_eq!(
            cfg.initial_endpoint.expect("endpoint").url,
            "unix:///var/run/docker.sock"
        );
        assert_eq!(cfg.hidden_labels.len(), 1);
    });
}

#[test]
fn from_env_with_config_file_errors_for_missing_path() {
    with_env_vars(&[], || {
        let missing = std::env::temp_dir().join("berth-does-not-exist.yml");
        let err = Config::from_env_with_config_file(missing).expect_err("missing file");
        assert!(err.contains("failed to read"));
    });
}

#[test]
fn from_env_errors_when_config_path_is_invalid() {
    with_env_vars(
        &[("BERTH_CONFIG", Some("/definitely/missing/berth.yml"))],
        || {
            let err = Config::from_env().expect_err("invalid env config");
            assert!(err.contains("failed to load BERTH_CONFIG"));
        },
    );
}

#[test]
fn from_env_loads_config_base64() {
    let yaml = r#"
listen: 127.0.0.1:5111
auth:
  jwtSecret: from-base64
"#;
    let encoded = B64.encode(yaml.as_bytes());

    with_env_vars(&[("BERTH_CONFIG_BASE64", Some(encoded.as_str()))], || {
        let cfg = Config::from_env().expect("config from base64 env");
        assert_eq!(cfg.bind.to_string(), "127.0.0.1:5111");
        assert_eq!(cfg.jwt_secret.as_deref(), Some("from-base64"));
    });
}

#[test]
fn from_env_errors_when_config_base64_is_invalid() {
    with_env_vars(&[("BERTH_CONFIG_BASE64", Some("%%%not-base64%%%"))], || {
        let err = Config::from_env().expect_err("invalid base64 config");
        assert!(err.contains("failed to decode BERTH_CONFIG_BASE64"));
    });
}

#[test]
fn from_env_errors_when_both_config_sources_are_set() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "listen: 127.0.0.1:4000").expect("write");
    let encoded = B64.encode("listen: 127.0.0.1:4001".as_bytes());

    with_env_vars(
        &[
            ("BERTH_CONFIG", Some(file.path().to_str().expect("utf8 path"))),
            ("BERTH_CONFIG_BASE64", Some(encoded.as_str())),
        ],
        || {
            let err = Config::from_env().expect_err("conflicting config sources");
            assert!(err.contains("BERTH_CONFIG and BERTH_CONFIG_BASE64"));
        },
    );
}

#[test]
fn port_env_overrides_bind() {
    with_env_vars(
        &[("BERTH_BIND", Some("127.0.0.1:4999")), ("PORT", Some("6123"))],
        || {
            let cfg = Config::from_env().expect("config from env");
            assert_eq!(cfg.bind.to_string(), "0.0.0.0:6123");
        },
    );
}

#[test]
fn env_builds_initial_endpoint_with_tls() {
    with_env_vars(
        &[
            ("BERTH_HOST", Some("tcp://10.0.0.9:2376")),
            ("BERTH_TLS_VERIFY", Some("true")),
            ("BERTH_TLS_CACERT", Some("/certs/ca.pem")),
            ("BERTH_TLS_CERT", Some("/certs/cert.pem")),
            ("BERTH_TLS_KEY", Some("/certs/key.pem")),
            ("BERTH_HIDE_LABELS", Some("owner=system,internal=true")),
            ("BERTH_NO_AUTH", Some("true")),
            ("BERTH_ENDPOINT_MANAGEMENT", Some("false")),
        ],
        || {
            let cfg = Config::from_env().expect("config from env");
            let endpoint = cfg.initial_endpoint.expect("initial endpoint");
            assert_eq!(endpoint.url, "tcp://10.0.0.9:2376");
            assert!(endpoint.tls.tls);
            assert!(!endpoint.tls.tls_skip_verify);
            assert_eq!(endpoint.tls.tls_key_path.as_deref(), Some("/certs/key.pem"));
            assert_eq!(cfg.hidden_labels.len(), 2);
            assert_eq!(cfg.hidden_labels[0].name, "owner");
            assert!(cfg.auth_disabled);
            assert!(!cfg.endpoint_management);
        },
    );
}

#[test]
fn env_rejects_unsupported_host_scheme() {
    with_env_vars(&[("BERTH_HOST", Some("http://10.0.0.9:2375"))], || {
        let err = Config::from_env().expect_err("invalid host");
        assert!(err.contains("unix:// or tcp://"));
    });
}

#[test]
fn merge_precedence_defaults_then_files_then_env() {
    let mut env_file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        env_file,
        r#"
listen: 127.0.0.1:4888
log:
  level: warn
stacks:
  dockerBinary: /usr/local/bin/docker
"#
    )
    .expect("write");

    let mut cli_file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        cli_file,
        r#"
listen: 127.0.0.1:4999
log:
  level: error
azure:
  loginUrl: http://login.cli.test
"#
    )
    .expect("write");

    with_env_vars(
        &[
            (
                "BERTH_CONFIG",
                Some(env_file.path().to_str().expect("utf8 path")),
            ),
            ("BERTH_AZURE_LOGIN_URL", Some("http://login.env.test/")),
            ("BERTH_MAX_BODY_SIZE", Some("1mb")),
        ],
        || {
            let cfg =
                Config::from_env_with_config_file(cli_file.path().to_path_buf()).expect("load");
            assert_eq!(cfg.bind.to_string(), "127.0.0.1:4999");
            assert_eq!(cfg.log_level, "error");
            assert_eq!(cfg.docker_binary, "docker");
            assert_eq!(cfg.azure_login_url, "http://login.env.test");
            assert_eq!(cfg.max_body_size, 1024 * 1024);
        },
    );
}

/// Runs `run` with every BERTH_* variable cleared except the given ones.
fn with_env_vars(vars: &[(&str, Option<&str>)], run: impl FnOnce()) {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let keys = BERTH_VARS
        .iter()
        .map(|key| key.to_string())
        .chain(vars.iter().map(|(key, _)| key.to_string()))
        .collect::<HashSet<_>>();
    let previous = keys
        .iter()
        .map(|key| (key.clone(), std::env::var(key).ok()))
        .collect::<Vec<_>>();

    for key in &keys {
        unsafe {
            std::env::remove_var(key);
        }
    }
    for (key, value) in vars {
        if let Some(value) = value {
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }

    let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(run));

    for (key, value) in previous {
        unsafe {
            match value {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }

    if let Err(payload) = run_result {
        std::panic::resume_unwind(payload);
    }
}
