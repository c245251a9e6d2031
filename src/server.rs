mod auth;
mod responses;
mod routes;

use std::future::Future;

use anyhow::{anyhow, Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, TraceLayer};
use tracing::{error, info, Level};

use crate::state::State;

pub use self::responses::ApiError;

async fn convert_errors<F, R>(fut: F) -> Result<R, ApiError>
where
    F: Future<Output = Result<R>>,
{
    match fut.await {
        Ok(r) => Ok(r),

        Err(e) => {
            error!("Error occured while processing an HTTP request: {e:#}");

            Err(ApiError::Internal)
        }
    }
}

pub fn router(state: State) -> Router {
    use axum::routing::{delete, get};

    Router::new()
        .route("/v1/healthz", get(routes::health))
        .route("/v1/err", get(routes::error))
        .route(
            "/v1/users",
            get(routes::get_current_user).post(routes::create_user),
        )
        .route("/v1/feeds", get(routes::get_feeds).post(routes::create_feed))
        .route("/v1/feeds/:id/posts", get(routes::get_feed_posts))
        .route(
            "/v1/feed_follows",
            get(routes::get_feed_follows).post(routes::create_feed_follow),
        )
        .route("/v1/feed_follows/:id", delete(routes::delete_feed_follow))
        .route("/v1/posts", get(routes::get_posts))
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_request(DefaultOnRequest::new().level(Level::INFO)),
            ),
        )
        .with_state(state)
}

pub struct Server {
    socket: TcpListener,
    app: Router,
}

impl Server {
    pub async fn new(state: State) -> Result<Self> {
        let bind_addr = state.cfg.bind_addr.clone();
        let socket = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| anyhow!("could not bind to `{bind_addr}`"))?;
        info!("Listening on `{bind_addr}`");

        Ok(Self {
            socket,
            app: router(state),
        })
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        axum::serve(self.socket, self.app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .context("the HTTP server encountered a failure")
    }
}
