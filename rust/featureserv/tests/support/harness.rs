use anyhow::Context;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use featureserv::{config::AppConfig, server::Server};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use serde_json::Value;
use std::{
    env,
    fs::{self, File},
    future::Future,
    io::BufReader,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Once,
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{sleep, Duration as TokioDuration},
};
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";
pub const SERVICE_PATH: &str = "/rest/services/wells/FeatureServer";
const DB_CONNECT_RETRIES: usize = 40;
const DB_CONNECT_DELAY_MS: u64 = 250;
const FIXTURE_LOCK_ID: i64 = 3_857_001;

static TRACING_INIT: Once = Once::new();

/// Runs a test against a router backed by a freshly seeded PostGIS database.
///
/// Skips (and passes) when `FEATURESERV_TEST_DATABASE_URL` is unset.
pub async fn with_feature_harness<F, Fut>(test: F)
where
    F: FnOnce(FeatureTestHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });

    let database_url = match env::var("FEATURESERV_TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!(
                "[featureserv-test] skipping: FEATURESERV_TEST_DATABASE_URL is not set"
            );
            return;
        }
    };

    let guard = FixtureGuard::acquire(&database_url)
        .await
        .expect("failed to lock fixture database");
    guard
        .reseed()
        .await
        .expect("failed to seed fixture database");

    let server = Server::new(test_config(database_url))
        .await
        .expect("failed to boot feature service for harness");
    let harness = FeatureTestHarness {
        router: server.router(),
    };

    test(harness).await;

    drop(guard);
}

fn test_config(database_url: String) -> AppConfig {
    AppConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        database_url,
        max_pool_size: 4,
        pg_ssl_root_cert: env::var("PGSSLROOTCERT").ok(),
        pg_ssl_cert: env::var("PGSSLCERT").ok(),
        pg_ssl_key: env::var("PGSSLKEY").ok(),
        api_key: Some(API_KEY.to_string()),
        registry_path: fixture_root().join("services.json"),
        default_limit: 100,
        max_limit: 500,
        request_timeout: Duration::from_secs(30),
    }
}

#[derive(Clone)]
pub struct FeatureTestHarness {
    router: Router,
}

impl FeatureTestHarness {
    /// GET with the query string appended verbatim.
    pub async fn get(&self, path: &str, query: &str) -> http::Response<Body> {
        let uri = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("failed to build harness request");
        self.send(request).await
    }

    /// Form encoded POST, the way ArcGIS clients submit edits and long queries.
    pub async fn post_form(
        &self,
        path: &str,
        fields: &[(&str, &str)],
        include_api_key: bool,
    ) -> http::Response<Body> {
        let body = fields
            .iter()
            .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(
                http::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            );
        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }
        let request = builder
            .body(Body::from(body))
            .expect("failed to build harness request");
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> http::Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

/// Percent-encodes everything outside the unreserved set.
pub fn encode(value: &str) -> String {
    value
        .bytes()
        .map(|byte| match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (byte as char).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect()
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let (status, bytes) = read_bytes(response).await;
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

pub async fn read_text(response: http::Response<Body>) -> (StatusCode, String) {
    let (status, bytes) = read_bytes(response).await;
    let text = String::from_utf8(bytes).expect("response body should be UTF-8");
    (status, text)
}

async fn read_bytes(response: http::Response<Body>) -> (StatusCode, Vec<u8>) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    (status, bytes.to_vec())
}

/// Holds an advisory lock so concurrent test binaries never reseed under each other.
struct FixtureGuard {
    client: Client,
    _connection_task: JoinHandle<()>,
}

impl FixtureGuard {
    async fn acquire(database_url: &str) -> anyhow::Result<Self> {
        let mut attempts = 0usize;
        let (client, task) = loop {
            let config: PgConfig = database_url
                .parse()
                .context("FEATURESERV_TEST_DATABASE_URL is invalid")?;
            match connect_with_env_tls(config, "fixture").await {
                Ok(connected) => break connected,
                Err(err) => {
                    attempts += 1;
                    if attempts >= DB_CONNECT_RETRIES {
                        return Err(err);
                    }
                    sleep(TokioDuration::from_millis(DB_CONNECT_DELAY_MS)).await;
                }
            }
        };
        client
            .execute("SELECT pg_advisory_lock($1)", &[&FIXTURE_LOCK_ID])
            .await?;
        Ok(Self {
            client,
            _connection_task: task,
        })
    }

    async fn reseed(&self) -> anyhow::Result<()> {
        self.client
            .batch_execute(&load_fixture("schema.sql")?)
            .await
            .context("schema.sql failed")?;
        self.client
            .batch_execute(&load_fixture("seed.sql")?)
            .await
            .context("seed.sql failed")?;
        Ok(())
    }
}

fn load_fixture(name: &str) -> anyhow::Result<String> {
    let path = fixture_root().join(name);
    fs::read_to_string(&path)
        .with_context(|| format!("failed to read fixture {name} from {}", path.display()))
}

fn fixture_root() -> PathBuf {
    if let Ok(root) = env::var("FEATURESERV_FIXTURE_ROOT") {
        let candidate = PathBuf::from(root);
        if candidate.exists() {
            return candidate;
        }
    }

    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

async fn connect_with_env_tls(
    config: PgConfig,
    label: &str,
) -> anyhow::Result<(Client, JoinHandle<()>)> {
    let label = label.to_string();
    if let Some(connector) = tls_connector_from_env()? {
        let (client, connection) = config.connect(connector).await?;
        let task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                eprintln!("{label} connection closed with error: {err}");
            }
        });
        Ok((client, task))
    } else {
        let (client, connection) = config.connect(NoTls).await?;
        let task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                eprintln!("{label} connection closed with error: {err}");
            }
        });
        Ok((client, task))
    }
}

fn tls_connector_from_env() -> anyhow::Result<Option<MakeRustlsConnect>> {
    let root_cert = match env::var("PGSSLROOTCERT") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => return Ok(None),
    };

    let mut reader =
        BufReader::new(File::open(&root_cert).context("failed to open PGSSLROOTCERT")?);
    let mut root_store = RootCertStore::empty();
    for cert in certs(&mut reader) {
        let cert = cert.context("failed to parse PGSSLROOTCERT")?;
        root_store
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let client_config = match (env::var("PGSSLCERT").ok(), env::var("PGSSLKEY").ok()) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_client_certs(&cert)?, load_client_key(&key)?)
            .context("failed to build client TLS config")?,
        _ => builder.with_no_client_auth(),
    };
    Ok(Some(MakeRustlsConnect::new(client_config)))
}

fn load_client_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLCERT file '{path}'"))?,
    );
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse PGSSLCERT")
}

fn load_client_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private keys")
}
