use crate::args::PostgresArgs;
use anyhow::{Result, bail};
use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, RecyclingMethod};
use rustls::ClientConfig;
use rustls::pki_types::CertificateDer;
use tokio_postgres::NoTls;

/// Builds the durable-store connection pool. TLS is used whenever a CA cert
/// is configured; otherwise the connection is plaintext, matching
/// `postgres_ssl_mode = "prefer"`'s default.
pub async fn create_pool(pg_args: PostgresArgs) -> Result<Pool> {
    let mut pg_pool_cfg = PgConfig::new();
    pg_pool_cfg.dbname = Some(pg_args.postgres_database);
    pg_pool_cfg.host = Some(pg_args.postgres_host);
    pg_pool_cfg.port = Some(pg_args.postgres_port);
    pg_pool_cfg.user = Some(pg_args.postgres_username);
    pg_pool_cfg.password = pg_args.postgres_password;
    pg_pool_cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    if let Some(ref ca_cert) = pg_args.postgres_ca_cert {
        let extra_roots = parse_ca_certs(ca_cert.as_bytes())?;
        let tls = make_rustls(extra_roots)?;
        Ok(pg_pool_cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), tls)?)
    } else {
        Ok(pg_pool_cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)?)
    }
}

fn make_rustls(extra_roots: Vec<CertificateDer<'static>>) -> Result<tokio_postgres_rustls::MakeRustlsConnect> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        roots.add(cert)?;
    }
    for cert in extra_roots {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(tokio_postgres_rustls::MakeRustlsConnect::new(config))
}

fn parse_ca_certs(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    if bytes.starts_with(b"-----BEGIN") {
        let mut rd: &[u8] = bytes;
        let mut out = Vec::new();
        for item in rustls_pemfile::read_all(&mut rd) {
            let item = item.map_err(|e| anyhow::anyhow!("failed to parse PEM bundle: {e}"))?;
            if let rustls_pemfile::Item::X509Certificate(der) = item {
                out.push(der);
            }
        }
        if out.is_empty() {
            bail!("no X509 certificates found in POSTGRES_CA_CERT");
        }
        Ok(out)
    } else {
        Ok(vec![CertificateDer::from(bytes.to_vec())])
    }
}
