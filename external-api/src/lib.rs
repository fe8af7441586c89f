//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck, diagnostics, metrics and
//! a read-only view of registered services. It exposes the following
//! endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /config
//! /services/:name
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::net::SocketAddr;

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};
use coordination::StoreClient;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{error, info, trace};

pub use crate::models::{Health, Instance, ServiceListing, State};

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Listens for health changes and serves them, together with metrics and
/// the current service registrations, over HTTP
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    client: StoreClient,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, client: StoreClient) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            client,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    fn router(state: State, client: StoreClient) -> Router {
        Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/config", routing::get(handlers::config))
            .route("/services/:name", routing::get(handlers::services))
            .layer(TraceLayer::new_for_http())
            .layer(Extension(state))
            .layer(Extension(client))
    }

    /// serve the HTTP external api
    async fn run(addr: SocketAddr, state: State, client: StoreClient) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Self::router(state, client);

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app).await?;
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let client = self.client.clone();
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run(addr, state, client),
                self.listen_status()
            ) {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(),
        }
    }
}

mod handlers {

    use anyhow::Context;
    use axum::{
        Json,
        body::Body,
        extract::{Extension, Path},
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use coordination::{
        ServiceKey, StoreClient,
        metrics::{START_TIME, UPTIME},
        service_prefix,
    };
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::{error, warn};

    use crate::models::{Health, Instance, ServerResult, ServiceListing, State};

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn services(
        Path(name): Path<String>,
        Extension(client): Extension<StoreClient>,
    ) -> ServerResult<Response<Body>> {
        let prefix = match service_prefix(&name) {
            Ok(prefix) => prefix,
            Err(err) => return Ok((StatusCode::BAD_REQUEST, err.to_string()).into_response()),
        };
        let snapshot = client.store().get_prefix(&prefix).await?;
        let mut instances = Vec::with_capacity(snapshot.entries.len());
        for kv in snapshot.entries {
            let Some(key) = ServiceKey::parse(&kv.key) else {
                warn!(key = %kv.key, "skipping malformed service key");
                continue;
            };
            let Ok(address) = String::from_utf8(kv.value) else {
                warn!(key = %kv.key, "skipping non utf-8 service address");
                continue;
            };
            instances.push(Instance {
                instance: key.instance().to_owned(),
                address,
            });
        }
        Ok(Json(ServiceListing {
            service: name,
            revision: snapshot.revision,
            instances,
        })
        .into_response())
    }

    pub(crate) async fn config(
        Extension(client): Extension<StoreClient>,
    ) -> ServerResult<impl IntoResponse> {
        // the validated config is not serializable, so serve what's on disk
        let path = client
            .config()
            .path()
            .context("no path specified for config")?;
        let cfg = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to find config at {}", path.display()))?;
        Ok(cfg)
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::response::IntoResponse;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Registered instances of one service, as read from the store
    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Eq)]
    pub struct ServiceListing {
        /// service name
        pub service: String,
        /// store revision the listing was read at
        pub revision: i64,
        /// registered instances, ordered by key
        pub instances: Vec<Instance>,
    }

    /// One registered instance
    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Eq)]
    pub struct Instance {
        /// instance id
        pub instance: String,
        /// `host:port` the instance serves on
        pub address: String,
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}
