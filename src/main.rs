//! Nodo Backend
//!
//! REST backend for a social-impact platform: nodes, users, stores and products
//! over a SQLite document store, with event-driven feed, notification,
//! achievement and thumbnail pipelines.

mod achievements;
mod api;
mod auth;
mod blob;
mod config;
mod db;
mod errors;
mod events;
mod feed;
mod models;
mod notify;
mod scheduler;
mod thumbnails;
mod triggers;

use std::sync::Arc;

use axum::{
    error_handling::HandleErrorLayer,
    middleware,
    routing::{get, post, put},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use achievements::AchievementEvaluator;
use auth::IdentityClient;
use blob::{BlobStore, LocalBlobStore};
use config::{Config, LogFormat};
use db::DocumentStore;
use errors::BoxError;
use events::EventLog;
use feed::FeedIndex;
use notify::{HttpPushSender, LogPushSender, NotificationEngine, PushSender};
use scheduler::Scheduler;
use thumbnails::ThumbnailPipeline;
use triggers::{Dispatcher, PlatformTriggers};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: DocumentStore,
    pub blobs: Arc<dyn BlobStore>,
    pub feed: FeedIndex,
    pub notifier: NotificationEngine,
    pub identity: Arc<IdentityClient>,
    pub config: Arc<Config>,
}

/// Everything a running process needs: request state plus the background workers.
pub struct App {
    pub state: AppState,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!("Starting Nodo Backend");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Blob root: {:?}", config.blob_root);
    tracing::info!(
        read = ?config.read_timeout,
        write = ?config.write_timeout,
        idle = ?config.idle_timeout,
        "Server timeouts"
    );

    if config.auth_webhook_secret.is_none() {
        tracing::warn!("No AUTH_WEBHOOK_SECRET configured. The auth hook is unauthenticated!");
    }

    let push = push_sender(&config)?;
    let identity = IdentityClient::shared(&config);
    let app = assemble(config.clone(), push, identity).await?;

    let shutdown = CancellationToken::new();
    let dispatcher = tokio::spawn({
        let dispatcher = app.dispatcher.clone();
        let shutdown = shutdown.clone();
        async move { dispatcher.run(shutdown).await }
    });
    let scheduler = tokio::spawn(app.scheduler.clone().run(shutdown.clone()));

    let router = create_router(app.state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    dispatcher.await.ok();
    scheduler.await.ok();
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Push transport from configuration: the HTTP gateway when set, log-only otherwise.
fn push_sender(config: &Config) -> Result<Arc<dyn PushSender>, BoxError> {
    match &config.push_gateway_url {
        Some(url) => {
            tracing::info!(url = %url, "push gateway configured");
            Ok(Arc::new(HttpPushSender::new(url, config.write_timeout)?))
        }
        None => {
            tracing::warn!("No PUSH_GATEWAY_URL configured. Push messages are only logged");
            Ok(Arc::new(LogPushSender))
        }
    }
}

/// Open storage and wire every service. Watched collections are subscribed
/// before anything can write to them.
pub async fn assemble(
    config: Config,
    push: Arc<dyn PushSender>,
    identity: Arc<IdentityClient>,
) -> Result<App, BoxError> {
    let pool = db::init_database(&config.db_path).await?;
    let events = EventLog::new(pool.clone());
    let store = DocumentStore::new(pool.clone(), events.clone());
    for collection in PlatformTriggers::watched_collections() {
        store.subscribe(collection);
    }

    let signing_key = match &config.blob_signing_key {
        Some(key) => key.clone(),
        None => {
            tracing::warn!("BLOB_SIGNING_KEY not set, signed URLs will not survive a restart");
            uuid::Uuid::new_v4().simple().to_string()
        }
    };
    let blobs: Arc<dyn BlobStore> = Arc::new(
        LocalBlobStore::open(
            pool,
            events.clone(),
            &config.blob_root,
            &config.blob_bucket,
            &config.public_base_url,
            signing_key.as_bytes(),
        )
        .await?,
    );

    let feed = FeedIndex::new(store.clone());
    let notifier = NotificationEngine::new(store.clone(), push);
    let achievements = AchievementEvaluator::new(store.clone(), notifier.clone());
    let thumbnails = ThumbnailPipeline::new(blobs.clone());
    let handler = Arc::new(PlatformTriggers::new(
        store.clone(),
        feed.clone(),
        notifier.clone(),
        achievements,
        thumbnails,
    ));

    let dispatcher = Arc::new(Dispatcher::new(events, handler, config.dispatch.clone()));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        notifier.clone(),
        blobs.clone(),
        config.scheduler.clone(),
    ));

    Ok(App {
        state: AppState {
            store,
            blobs,
            feed,
            notifier,
            identity,
            config: Arc::new(config),
        },
        dispatcher,
        scheduler,
    })
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let identity = state.identity.clone();

    // Bearer-authenticated routes
    let api_routes = Router::new()
        // Nodes
        .route("/nodes", get(api::list_nodes).post(api::create_node))
        .route("/nodes/popular", get(api::popular_nodes))
        .route(
            "/nodes/{id}",
            get(api::get_node)
                .put(api::update_node)
                .delete(api::delete_node),
        )
        .route("/nodes/{id}/followers", get(api::list_followers))
        .route(
            "/nodes/{id}/followers/{user_id}",
            post(api::add_follower).delete(api::remove_follower),
        )
        .route("/nodes/{id}/interactions", post(api::record_interaction))
        .route("/nodes/{id}/products", get(api::list_node_products))
        // Stores
        .route("/stores", get(api::list_stores).post(api::create_store))
        .route(
            "/stores/{id}",
            get(api::get_store)
                .put(api::update_store)
                .delete(api::delete_store),
        )
        // Products
        .route("/products", get(api::list_products).post(api::create_product))
        .route(
            "/products/{id}",
            get(api::get_product)
                .put(api::update_product)
                .delete(api::delete_product),
        )
        .route("/products/{id}/approve", post(api::approve_product))
        .route("/products/{id}/reject", post(api::reject_product))
        // Users
        .route("/users", get(api::list_users).post(api::create_user))
        .route(
            "/users/{id}",
            get(api::get_user)
                .put(api::update_user)
                .delete(api::delete_user),
        )
        .route(
            "/users/{id}/following/{target_id}",
            post(api::follow_user).delete(api::unfollow_user),
        )
        .route("/users/{id}/images/{name}", put(api::upload_image))
        .route("/users/{id}/files/{name}", put(api::upload_file))
        // Feed and notifications
        .route("/feed", get(api::get_feed))
        .route("/notifications", get(api::list_notifications))
        .route(
            "/notifications/{id}/read",
            post(api::mark_notification_read),
        )
        .layer(middleware::from_fn(move |req, next| {
            auth::bearer_auth_layer(identity.clone(), req, next)
        }));

    // Routes authenticated by other means (or not at all)
    let public_routes = Router::new()
        .route("/health", get(api::health_check))
        .route("/hooks/auth", post(api::auth_hook))
        .route("/blobs/{*path}", get(api::download_blob));

    let read_timeout = state.config.read_timeout;
    let write_timeout = state.config.write_timeout;

    Router::new()
        .merge(api_routes)
        .merge(public_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(HandleErrorLayer::new(errors::handle_middleware_error))
                .layer(TimeoutLayer::new(write_timeout))
                .layer(RequestBodyTimeoutLayer::new(read_timeout)),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod test_support;
