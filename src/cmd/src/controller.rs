use clap::Parser;
use portd_kubernetes::controller::config::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};

#[derive(Debug, Clone, Parser)]
pub struct ControllerCmd {
    #[arg(long = "http-port", default_value_t = DEFAULT_HTTP_PORT, help = "HTTP server serving port")]
    pub http_port: u32,

    #[arg(long = "https-port", default_value_t = DEFAULT_HTTPS_PORT, help = "HTTPS server serving port")]
    pub https_port: u32,

    #[arg(short = 'f', long, help = "Config file path for the controller")]
    pub file: Option<String>,

    #[arg(long = "tls-cert", help = "path to TLS Certificate for the webhook server")]
    pub tls_cert: Option<String>,

    #[arg(long = "tls-key", help = "path to TLS Key for the webhook server")]
    pub tls_key: Option<String>,

    #[arg(long = "bulk-mode", help = "Synchronize listeners of a load balancer in batches")]
    pub bulk_mode: bool,

    #[arg(short, long, help = "Default cloud region of pool items")]
    pub region: Option<String>,
}
