use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use p384::pkcs8::EncodePublicKey;
use p384::SecretKey;

/// Parse a SEC1 DER private key file.
pub fn read_private_key(path: &Path) -> anyhow::Result<SecretKey> {
    let der = std::fs::read(path).with_context(|| format!("read key {}", path.display()))?;
    SecretKey::from_sec1_der(&der)
        .map_err(|e| anyhow::anyhow!("parse key {}: {e}", path.display()))
}

fn generated_key_paths(dir: &Path, first_domain: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{first_domain}-private.key")),
        dir.join(format!("{first_domain}-public.key")),
    )
}

/// Obtain the signing key for a backend with new-RealIP enabled.
///
/// Resolution order: the configured key path, then a previously generated
/// `<firstDomain>-private.key` sibling to the config file, then a freshly
/// generated keypair persisted as `<firstDomain>-private.key` (SEC1 DER) and
/// `<firstDomain>-public.key` (SPKI DER). The public half is what operators
/// hand to the backend for signature verification.
pub fn provide_key(
    config_dir: &Path,
    first_domain: &str,
    configured: Option<&Path>,
) -> anyhow::Result<SecretKey> {
    if let Some(path) = configured {
        match std::fs::read(path) {
            Ok(der) => {
                return SecretKey::from_sec1_der(&der)
                    .map_err(|e| anyhow::anyhow!("parse key {}: {e}", path.display()));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("read key {}", path.display()));
            }
        }
    }

    let (private_path, public_path) = generated_key_paths(config_dir, first_domain);
    if private_path.exists() {
        return read_private_key(&private_path);
    }

    tracing::info!(
        domain = %first_domain,
        path = %private_path.display(),
        "keys: no existing key found, generating one"
    );
    generate_keys(&private_path, &public_path)
}

fn generate_keys(private_path: &Path, public_path: &Path) -> anyhow::Result<SecretKey> {
    let key = SecretKey::random(&mut rand::thread_rng());

    let private_der = key
        .to_sec1_der()
        .map_err(|e| anyhow::anyhow!("encode private key: {e}"))?;
    std::fs::write(private_path, private_der.as_ref() as &[u8])
        .with_context(|| format!("write {}", private_path.display()))?;

    let public_der = key
        .public_key()
        .to_public_key_der()
        .map_err(|e| anyhow::anyhow!("encode public key: {e}"))?;
    std::fs::write(public_path, public_der.as_bytes())
        .with_context(|| format!("write {}", public_path.display()))?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_keypair() {
        let dir = tempfile::tempdir().expect("tempdir");

        let key = provide_key(dir.path(), "example.local", None).expect("provide");
        let (private_path, public_path) = generated_key_paths(dir.path(), "example.local");
        assert!(private_path.exists());
        assert!(public_path.exists());

        // A second call loads the persisted key instead of generating anew.
        let again = provide_key(dir.path(), "example.local", None).expect("provide");
        assert_eq!(key.public_key(), again.public_key());
    }

    #[test]
    fn configured_path_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("custom.key");

        let key = SecretKey::random(&mut rand::thread_rng());
        std::fs::write(&key_path, key.to_sec1_der().expect("der").as_ref() as &[u8])
            .expect("write");

        let loaded =
            provide_key(dir.path(), "example.local", Some(&key_path)).expect("provide");
        assert_eq!(loaded.public_key(), key.public_key());
    }

    #[test]
    fn missing_configured_path_falls_back_to_generation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.key");

        provide_key(dir.path(), "example.local", Some(&missing)).expect("provide");
        assert!(dir.path().join("example.local-private.key").exists());
    }

    #[test]
    fn garbage_key_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("bad.key");
        std::fs::write(&key_path, b"not a key").expect("write");

        assert!(provide_key(dir.path(), "example.local", Some(&key_path)).is_err());
    }
}
