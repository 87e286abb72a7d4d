use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Build the acceptor from a PEM certificate chain and private key.
/// Both paths or neither; `None` means plaintext only.
pub fn load_tls_acceptor(cert_path: Option<&Path>, key_path: Option<&Path>) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "SLOTD_TLS_CERT and SLOTD_TLS_KEY must be set together",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?)).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "no certificates found in cert file"));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_when_unset() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_an_error() {
        let err = load_tls_acceptor(Some(Path::new("cert.pem")), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = std::env::temp_dir().join("slotd_test_tls");
        let err = load_tls_acceptor(Some(&dir.join("nope.pem")), Some(&dir.join("nope.key")))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn empty_cert_file_rejected() {
        let dir = std::env::temp_dir().join("slotd_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.pem");
        std::fs::write(&cert, b"").unwrap();
        let err = load_tls_acceptor(Some(&cert), Some(&cert)).err().unwrap();
        assert!(err.to_string().contains("no certificates"));
    }
}
