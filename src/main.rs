use berth::{
    config::{Config, InitialEndpointConfig, parse_label_pair, validate_endpoint_url},
    constants::APP_VERSION,
    models::Pair,
    runtime::run_standalone,
};
use std::{net::SocketAddr, path::PathBuf};

const USAGE: &str = "\
Usage: berth [OPTIONS]

Options:
  -c, --config <path>       Path to a YAML config file
  -b, --bind <addr>         Address to listen on
  -d, --data <dir>          Directory holding the store and compose projects
  -H, --host <url>          Endpoint registered at first start (unix:// or tcp://)
  -l, --hide-label <k=v>    Hide containers carrying this label (repeatable)
      --no-auth             Disable authentication
  -V, --version             Print version
  -h, --help                Print help

Every setting can also be given as a BERTH_* environment variable.
Flags take precedence over the environment and config files.
";

/// Command-line values layered over the loaded configuration.
#[derive(Debug, Default, PartialEq, Eq)]
struct CliOverrides {
    bind: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
    host: Option<String>,
    hidden_labels: Vec<Pair>,
    no_auth: bool,
}

impl CliOverrides {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(url) = self.host {
            let tls = config
                .initial_endpoint
                .take()
                .map(|endpoint| endpoint.tls)
                .unwrap_or_default();
            config.initial_endpoint = Some(InitialEndpointConfig { url, tls });
        }
        if !self.hidden_labels.is_empty() {
            config.hidden_labels = self.hidden_labels;
        }
        if self.no_auth {
            config.auth_disabled = true;
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CliOptions {
    config_path: Option<PathBuf>,
    overrides: CliOverrides,
    help: bool,
    version: bool,
}

/// Splits `--flag=value` into its parts; bare flags take the next argument.
fn flag_value<I>(flag: &str, inline: Option<&str>, args: &mut I) -> Result<String, String>
where
    I: Iterator<Item = String>,
{
    let value = match inline {
        Some(value) => value.to_string(),
        None => args
            .next()
            .ok_or_else(|| format!("missing value for {flag}"))?,
    };
    if value.is_empty() {
        return Err(format!("missing value for {flag}"));
    }
    Ok(value)
}

fn parse_cli_args<I>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = String>,
{
    let mut options = CliOptions::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (name, inline) = match arg.split_once('=') {
            Some((name, value)) if name.starts_with("--") => (name.to_string(), Some(value)),
            _ => (arg.clone(), None),
        };
        match name.as_str() {
            "-h" | "--help" => options.help = true,
            "-V" | "--version" => options.version = true,
            "--no-auth" => options.overrides.no_auth = true,
            "-c" | "--config" => {
                let value = flag_value("--config", inline, &mut args)?;
                options.config_path = Some(PathBuf::from(value));
            }
            "-b" | "--bind" => {
                let value = flag_value("--bind", inline, &mut args)?;
                let bind = value
                    .parse::<SocketAddr>()
                    .map_err(|err| format!("invalid --bind value '{value}': {err}"))?;
                options.overrides.bind = Some(bind);
            }
            "-d" | "--data" => {
                let value = flag_value("--data", inline, &mut args)?;
                options.overrides.data_dir = Some(PathBuf::from(value));
            }
            "-H" | "--host" => {
                let value = flag_value("--host", inline, &mut args)?;
                validate_endpoint_url(&value)?;
                options.overrides.host = Some(value);
            }
            "-l" | "--hide-label" => {
                let value = flag_value("--hide-label", inline, &mut args)?;
                options
                    .overrides
                    .hidden_labels
                    .push(parse_label_pair(&value)?);
            }
            _ => return Err(format!("unknown argument: {arg}")),
        }
    }
    Ok(options)
}

#[tokio::main]
async fn main() {
    let options = match parse_cli_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    if options.help {
        println!("{USAGE}");
        return;
    }
    if options.version {
        println!("berth {APP_VERSION}");
        return;
    }

    let loaded = match options.config_path {
        Some(config_path) => Config::from_env_with_config_file(config_path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };
    options.overrides.apply(&mut config);

    if let Err(err) = run_standalone(config).await {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }
}
