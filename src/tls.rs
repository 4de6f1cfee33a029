use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::Config;

/// Acceptor for the configured certificate pair, or `None` for plaintext.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let (Some(cert_path), Some(key_path)) = (config.tls_cert.as_deref(), config.tls_key.as_deref()) else {
        return Ok(None);
    };

    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

fn read_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidInput, format!("no certificates in {path}")));
    }
    Ok(certs)
}

fn read_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(File::open(path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no private key in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: Vec<(String, String)> = vars.iter().map(|(k, v)| (format!("SLOTGRID_{k}"), v.to_string())).collect();
        Config::from_lookup(|name| vars.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())).unwrap()
    }

    #[test]
    fn plaintext_without_paths() {
        assert!(load_tls_acceptor(&config(&[])).unwrap().is_none());
    }

    #[test]
    fn missing_files_are_errors() {
        let c = config(&[("TLS_CERT", "/nonexistent/cert.pem"), ("TLS_KEY", "/nonexistent/key.pem")]);
        assert!(load_tls_acceptor(&c).is_err());
    }

    #[test]
    fn empty_pem_rejected() {
        let dir = std::env::temp_dir().join("slotgrid_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.pem");
        std::fs::write(&cert, "").unwrap();
        let path = cert.to_str().unwrap();
        let c = config(&[("TLS_CERT", path), ("TLS_KEY", path)]);
        match load_tls_acceptor(&c) {
            Err(err) => assert_eq!(err.kind(), ErrorKind::InvalidInput),
            Ok(_) => panic!("empty PEM accepted"),
        }
    }
}
