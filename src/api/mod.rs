//! HTTP server wiring.

pub mod handlers;
mod openapi;

pub use openapi::openapi;

use anyhow::{Context, Result};
use axum::Extension;
use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{HeaderName, HeaderValue, Request};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::request_id::PropagateRequestIdLayer;
use tower_http::set_header::SetRequestHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{Span, info, info_span, warn};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

use crate::db;
use crate::event;
use crate::keybase::{KeybaseClient, Notifier};
use crate::secondary::{BrokerFactorClient, FactorClient};
use crate::settings::Settings;
use crate::sso::BrokerClient;
use crate::task::{self, TaskConfig};

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Start the server.
///
/// # Errors
/// Returns an error if the database, clients or listener cannot be set up.
pub async fn new(port: u16, dsn: String, task_config: TaskConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    db::migrate(&pool).await?;

    let settings = Arc::new(Settings::load(&pool).await?);

    let broker = Arc::new(BrokerClient::new(
        settings.auth_server(),
        settings.license(),
    )?);
    let factor_client: Arc<dyn FactorClient> = Arc::new(BrokerFactorClient::new(
        settings.auth_server(),
        settings.license(),
    )?);
    let keybase_client = Arc::new(KeybaseClient::new()?);
    let notifier = Arc::new(Notifier::new());

    task::spawn_sweeper(pool.clone(), Arc::clone(&settings), task_config);
    spawn_association_bridge(pool.clone(), Arc::clone(&notifier)).await?;

    let (router, _openapi) = router().split_for_parts();
    let app = router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(settings))
            .layer(Extension(broker))
            .layer(Extension(factor_client))
            .layer(Extension(keybase_client))
            .layer(Extension(notifier))
            .layer(Extension(pool)),
    );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

/// Forward cross-node association changes into the local notifier so
/// long-polls on this node wake without waiting for their poll tick.
async fn spawn_association_bridge(pool: sqlx::PgPool, notifier: Arc<Notifier>) -> Result<()> {
    let mut listener = event::subscribe_listener(
        pool,
        vec![crate::keybase::association::EVENT_CHANNEL.to_string()],
    )
    .await?;

    tokio::spawn(async move {
        while let Some(evt) = listener.next().await {
            match evt.data.get("id").and_then(|id| id.as_str()) {
                Some(id) => notifier.notify(id),
                None => warn!("association event without id"),
            }
        }
    });

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
