//! RSA-2048 private key generation and caching (`initialize_key`, §4.3).
//!
//! `rcgen` does not generate RSA key material itself, so key generation goes
//! through the `rsa` crate and the PKCS#8 PEM is handed to `rcgen::KeyPair`
//! for certificate/CSR signing — the same division of labor other crates in
//! the retrieval pack use when they need RSA keys alongside `rcgen`.

use std::fs;
use std::path::{Path, PathBuf};

use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tracing::info;

const RSA_KEY_BITS: usize = 2048;
const KEY_FILE_NAME: &str = "server.key";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("rsa key generation failed: {0}")]
    Generate(#[from] rsa::Error),
    #[error("pkcs8 encoding failed: {0}")]
    Encode(#[from] rsa::pkcs8::Error),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `initialize_key()`: load the cached private key, or generate and persist
/// one (file mode 0600) if none exists. Idempotent — a second call against
/// the same cache directory is a plain read.
pub fn initialize_key(cache_dir: &Path) -> Result<String, KeyError> {
    fs::create_dir_all(cache_dir).map_err(|source| KeyError::Io {
        path: cache_dir.to_path_buf(),
        source,
    })?;
    set_dir_permissions(cache_dir)?;

    let key_path = cache_dir.join(KEY_FILE_NAME);
    if key_path.exists() {
        return fs::read_to_string(&key_path).map_err(|source| KeyError::Io {
            path: key_path.clone(),
            source,
        });
    }

    info!(path = %key_path.display(), "generating RSA-2048 private key");
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)?;
    let pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();

    write_atomically(&key_path, pem.as_bytes())?;
    set_key_permissions(&key_path)?;

    Ok(pem)
}

/// Write `contents` to `path` via write-temp + rename so concurrent readers
/// never observe a partially written file (§5, "Certificate cache on disk").
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), KeyError> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents).map_err(|source| KeyError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(unix)]
fn set_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn set_key_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_a_key_on_first_call_and_reuses_it_on_the_second() {
        let dir = tempfile::tempdir().unwrap();
        let first = initialize_key(dir.path()).unwrap();
        let second = initialize_key(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("PRIVATE KEY"));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        initialize_key(dir.path()).unwrap();
        let meta = fs::metadata(dir.path().join(KEY_FILE_NAME)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
