//! HTTPS trust store initialization
//!
//! Remote stores talk TLS through one shared client configuration,
//! built once at startup: the platform trust store, plus any extra
//! certificates found in a well-known PEM bundle. A missing bundle is
//! silently ignored. This is the only process-wide global besides the
//! log subscriber.

use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Extra CA bundle appended to the trust store when present
pub const CA_BUNDLE_PATH: &str = "/etc/cacert.crt";

static TLS_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Build the shared client configuration eagerly
pub fn init() {
    let _ = client_config();
}

/// The shared TLS client configuration
pub fn client_config() -> Arc<ClientConfig> {
    TLS_CONFIG
        .get_or_init(|| Arc::new(build_config(Path::new(CA_BUNDLE_PATH))))
        .clone()
}

fn build_config(extra_bundle: &Path) -> ClientConfig {
    let mut roots = RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = roots.add(cert);
            }
        }
        Err(e) => tracing::warn!("could not load platform trust store: {e}"),
    }

    let added = append_pem_bundle(&mut roots, extra_bundle);
    if added > 0 {
        tracing::info!(
            "added {added} certificates from {}",
            extra_bundle.display()
        );
    }

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Append every certificate in a PEM bundle. Absence is silent; a
/// malformed bundle is logged and skipped.
fn append_pem_bundle(roots: &mut RootCertStore, path: &Path) -> usize {
    let Ok(file) = File::open(path) else {
        return 0;
    };
    let mut reader = BufReader::new(file);
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        match cert {
            Ok(cert) => {
                if roots.add(cert).is_ok() {
                    added += 1;
                }
            }
            Err(e) => {
                tracing::warn!("skipping malformed certificate in {}: {e}", path.display());
                break;
            }
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_bundle_is_silent() {
        let dir = TempDir::new().unwrap();
        let mut roots = RootCertStore::empty();
        let added = append_pem_bundle(&mut roots, &dir.path().join("absent.crt"));
        assert_eq!(added, 0);
    }

    #[test]
    fn test_non_pem_bundle_adds_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.crt");
        std::fs::write(&path, b"this is not a certificate").unwrap();

        let mut roots = RootCertStore::empty();
        let added = append_pem_bundle(&mut roots, &path);
        assert_eq!(added, 0);
    }

    #[test]
    fn test_client_config_is_shared() {
        let a = client_config();
        let b = client_config();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
