use std::{fs::File, io::BufReader};

use anyhow::{anyhow, Context};
use rustls::{Certificate, PrivateKey};

pub fn load_certificates_from_pem(path: &str) -> anyhow::Result<Vec<Certificate>> {
    let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(anyhow!("No certificate found in {path}"));
    }

    Ok(certs.into_iter().map(Certificate).collect())
}

pub fn load_private_key_from_file(path: &str) -> anyhow::Result<PrivateKey> {
    let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
    let mut reader = BufReader::new(file);

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;

    match keys.len() {
        0 => Err(anyhow!("No PKCS8-encoded private key found in {path}")),
        1 => Ok(PrivateKey(keys.remove(0))),
        _ => Err(anyhow!("More than one PKCS8-encoded private key found in {path}")),
    }
}
