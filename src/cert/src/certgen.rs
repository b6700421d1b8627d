use std::{fs::File, io::Write, ops::Add};

use rcgen::{Certificate, CertificateParams, ExtendedKeyUsagePurpose, KeyUsagePurpose};
use time::{Duration, OffsetDateTime};

use super::constants::{CERT_FILE_NAME, KEY_FILE_NAME};

const VALID_DAYS: i64 = 3650;

/// Writes a self-signed server certificate and its key for the webhook server.
/// Returns the paths of the certificate and the key.
pub fn generate(host: &str, out_dir: &str) -> anyhow::Result<(String, String)> {
    let mut params = CertificateParams::new(vec![host.to_string()]);
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc().add(Duration::days(VALID_DAYS));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = Certificate::from_params(params)?;

    let cert_path = format!("{out_dir}/{CERT_FILE_NAME}");
    let key_path = format!("{out_dir}/{KEY_FILE_NAME}");

    File::create(&cert_path)?.write_all(cert.serialize_pem()?.as_bytes())?;
    File::create(&key_path)?.write_all(cert.serialize_private_key_pem().as_bytes())?;

    Ok((cert_path, key_path))
}
