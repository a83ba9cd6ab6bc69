use crate::config::AppConfig;
use crate::error::ServiceError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection};
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info, warn};

pub type PgPool = Pool<PgConnectionManager>;
pub type PgConn<'a> = PooledConnection<'a, PgConnectionManager>;

pub async fn connect_pool(config: &AppConfig) -> Result<PgPool> {
    let tls = TlsFiles {
        root_cert: config.pg_ssl_root_cert.as_deref(),
        client_cert: config.pg_ssl_cert.as_deref(),
        client_key: config.pg_ssl_key.as_deref(),
    };
    let manager = PgConnectionManager::new(&config.database_url, tls)?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .connection_timeout(config.request_timeout)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    // Fail loudly at boot when credentials are wrong, but keep serving.
    match pool.get().await {
        Ok(_) => info!("database connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

pub async fn checkout(pool: &PgPool) -> crate::error::Result<PgConn<'_>> {
    pool.get().await.map_err(|err| {
        error!(error = ?err, "failed to acquire database connection");
        ServiceError::Internal(anyhow::anyhow!("{err:?}"))
    })
}

struct TlsFiles<'a> {
    root_cert: Option<&'a str>,
    client_cert: Option<&'a str>,
    client_key: Option<&'a str>,
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: Option<MakeRustlsConnect>,
}

impl PgConnectionManager {
    fn new(database_url: &str, tls: TlsFiles<'_>) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid database URL")?;
        let tls = match tls.root_cert {
            Some(root) => Some(build_tls_connector(root, tls.client_cert, tls.client_key)?),
            None => {
                if tls.client_cert.is_some() || tls.client_key.is_some() {
                    warn!("PGSSLCERT/PGSSLKEY ignored because PGSSLROOTCERT is not set");
                }
                None
            }
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = match &self.tls {
            None => {
                let (client, connection) = self.config.connect(NoTls).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
            Some(connector) => {
                let (client, connection) = self.config.connect(connector.clone()).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
        };
        conn.map_err(|err| anyhow::anyhow!(err))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

fn build_tls_connector(
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<MakeRustlsConnect> {
    let mut root_store = RootCertStore::empty();
    for cert in read_certs(root_cert, "PGSSLROOTCERT")? {
        root_store
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let client_config = match (client_cert, client_key) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert), Some(key)) => {
            let chain = read_certs(cert, "PGSSLCERT")?;
            if chain.is_empty() {
                anyhow::bail!("PGSSLCERT contained no certificates");
            }
            builder
                .with_client_auth_cert(chain, read_key(key)?)
                .with_context(|| format!("failed to build client TLS config for {root_cert}"))?
        }
        _ => anyhow::bail!("PGSSLCERT and PGSSLKEY must both be set (or neither)"),
    };

    Ok(MakeRustlsConnect::new(client_config))
}

fn read_certs(path: &str, label: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open {label} file '{path}'"))?,
    );
    certs(&mut reader)
        .map(|cert| cert.with_context(|| format!("failed to parse {label}")))
        .collect()
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?,
    );

    rustls_pemfile::private_key(&mut reader)
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private keys")
}
