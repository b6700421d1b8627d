pub const DEFAULT_TLS_CERT: &str = "/etc/portd/cert/tls.crt";
pub const DEFAULT_TLS_KEY: &str = "/etc/portd/cert/tls.key";
pub const DEFAULT_SERVICE_HOST: &str = "portd-webhook-service.kube-system.svc";
pub const CERT_FILE_NAME: &str = "tls.crt";
pub const KEY_FILE_NAME: &str = "tls.key";
