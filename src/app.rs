use std::sync::Arc;

use axum::{extract::FromRef, http::Uri, routing, Router};

use crate::{
    api::v1::{account, auth, custody, lifecycle, parcel, tamper, token::JwtState, user},
    config::{Config, LifecyclePolicy},
    error::{Error, Resource},
    notify::{DynNotifier, LogNotifier},
    store::{DynStore, MemoryStore, MongoStore},
};

#[derive(FromRef, Clone)]
pub struct AppState {
    pub argon: argon2::Argon2<'static>,
    pub jwt_state: JwtState,

    pub store: DynStore,
    pub notifier: DynNotifier,
    pub policy: LifecyclePolicy,
}

impl AppState {
    pub fn with_parts(
        config: &Config,
        store: DynStore,
        notifier: DynNotifier,
    ) -> Result<Self, Error> {
        let jwt_state = JwtState::new(
            &config.jwt_keys,
            config.access_token_ttl,
            config.refresh_token_ttl,
        )?;

        Ok(Self {
            argon: argon2::Argon2::default(),
            jwt_state,

            store,
            notifier,
            policy: config.lifecycle,
        })
    }

    pub async fn new(config: &Config) -> Result<Self, Error> {
        let store: DynStore = match &config.mongodb_uri {
            Some(uri) => {
                let store = MongoStore::connect(uri, &config.database_name).await?;
                store.run_migration().await?;
                tracing::info!(database = %config.database_name, "using mongodb store");
                Arc::new(store)
            }
            None => {
                tracing::warn!("MONGODB_URI is not set, data lives in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        let state = Self::with_parts(config, store, Arc::new(LogNotifier))?;

        if let Some(admin) = &config.bootstrap_admin {
            auth::seed_admin(&state.store, &state.argon, admin).await?;
        }

        Ok(state)
    }
}

async fn fallback(uri: Uri) -> Error {
    Error::NotFound(Resource::Route(uri))
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .nest(
            "/auth",
            Router::new()
                .route("/register", routing::post(auth::register))
                .route("/login", routing::post(auth::login))
                .route("/logout", routing::post(auth::logout))
                .route("/refresh", routing::post(auth::refresh_access_token))
                .route("/profile", routing::get(user::profile)),
        )
        .nest(
            "/accounts",
            Router::new()
                .route("/", routing::get(account::index))
                .route("/:id/role", routing::put(account::set_role)),
        )
        .nest(
            "/parcels",
            Router::new()
                .route("/", routing::get(parcel::index).post(parcel::create))
                .route("/sender/:sender_id", routing::get(parcel::index_by_sender))
                .route("/:tracking_id", routing::get(parcel::show))
                .route(
                    "/:tracking_id/status",
                    routing::put(lifecycle::transition_status),
                )
                .route(
                    "/:tracking_id/otp",
                    routing::post(lifecycle::verify_delivery_otp),
                )
                .route(
                    "/:tracking_id/checkpoint",
                    routing::post(tamper::verify_checkpoint),
                )
                .route("/:tracking_id/history", routing::get(custody::history)),
        )
        .route(
            "/handlers/:handler_id/history",
            routing::get(custody::handler_history),
        )
        .nest(
            "/alerts",
            Router::new()
                .route("/", routing::get(tamper::index))
                .route("/:id/resolve", routing::post(tamper::resolve)),
        );

    Router::new()
        .nest("/api/v1", v1)
        .fallback(fallback)
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
