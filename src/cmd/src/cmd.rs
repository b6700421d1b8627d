use clap::{Parser, Subcommand, ValueEnum};

use portd_kubernetes::controller::config::Config;
use portd_trace::init::TraceConfig;

use crate::controller::ControllerCmd;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cmd {
    #[arg(
        short,
        long,
        global = true,
        required = false,
        default_value = "info",
        help = "Log level(trace, debug, info, warn, error)"
    )]
    pub level: String,

    #[arg(
        value_enum,
        short = 'd',
        long,
        global = true,
        required = false,
        default_value = "plain",
        help = "Log display format"
    )]
    pub format: Format,

    #[arg(short = 'o', long = "log-file", global = true, help = "Log output file path")]
    pub log_file: Option<String>,

    #[clap(subcommand)]
    pub sub: SubCmd,
}

#[derive(Debug, Clone, Parser, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Plain => write!(f, "plain"),
            Format::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum SubCmd {
    /// Run the controller and its webhook server
    Controller(ControllerCmd),
    /// Print CRD manifests
    Crd,
    Version,
}

pub fn run() {
    let command = Cmd::parse();

    match command.sub {
        SubCmd::Version => println!("{}", env!("CARGO_PKG_VERSION")),
        SubCmd::Crd => match portd_kubernetes::crd::generate() {
            Ok(crds) => print!("{crds}"),
            Err(e) => {
                eprintln!("failed to generate CRDs: {e}");
                std::process::exit(1);
            }
        },
        SubCmd::Controller(c) => {
            let trace_conf = TraceConfig {
                level: command.level,
                format: command.format.to_string(),
                file: command.log_file,
            };

            let config = match c.file.as_deref() {
                None => Ok(Config::default()),
                Some(file) => Config::load(file),
            };
            let config = match config {
                Ok(config) => apply_flags(config, c),
                Err(e) => {
                    eprintln!("failed to load config: {e}");
                    std::process::exit(1);
                }
            };

            portd_kubernetes::controller::server::start(config, trace_conf);
        }
    }
}

// Flags given explicitly win over the config file.
fn apply_flags(mut config: Config, c: ControllerCmd) -> Config {
    if c.http_port != portd_kubernetes::controller::config::DEFAULT_HTTP_PORT {
        config.http_port = c.http_port;
    }
    if c.https_port != portd_kubernetes::controller::config::DEFAULT_HTTPS_PORT {
        config.https_port = c.https_port;
    }
    if let Some(cert) = c.tls_cert {
        config.tls.cert = cert;
    }
    if let Some(key) = c.tls_key {
        config.tls.key = key;
    }
    if c.bulk_mode {
        config.bulk_mode = true;
    }
    if let Some(region) = c.region {
        config.region = region;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cmd = Cmd::parse_from([
            "portd",
            "--level",
            "debug",
            "controller",
            "--https-port",
            "9443",
            "--tls-cert",
            "/tmp/tls.crt",
            "--bulk-mode",
            "--region",
            "ap-tokyo",
        ]);
        assert_eq!(cmd.level, "debug");
        let c = match cmd.sub {
            SubCmd::Controller(c) => c,
            _ => panic!("expected controller subcommand"),
        };
        let base = Config {
            http_port: 9080,
            ..Config::default()
        };
        let config = apply_flags(base, c);
        assert_eq!(config.http_port, 9080);
        assert_eq!(config.https_port, 9443);
        assert_eq!(config.tls.cert, "/tmp/tls.crt");
        assert!(config.bulk_mode);
        assert_eq!(config.region, "ap-tokyo");
    }

    #[test]
    fn works_global_log_flags() {
        let cmd = Cmd::parse_from(["portd", "crd", "-d", "json", "-o", "/tmp/portd.log"]);
        assert!(matches!(cmd.sub, SubCmd::Crd));
        assert_eq!(cmd.format.to_string(), "json");
        assert_eq!(cmd.log_file.as_deref(), Some("/tmp/portd.log"));
    }
}
