use std::sync::Arc;

use session_authority::core::auth::{
    AuthApiState, JwtService, SessionService, TokenAuthority, app_router,
};
use session_authority::core::config::Config;
use session_authority::core::store::{MemoryStore, RedisStore, SessionStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load .env file (if exists)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Missing secret or credential source: refuse to start
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    // Log config status (without revealing secrets)
    let backend = if config.uses_memory_store() {
        "memory"
    } else {
        "redis"
    };
    tracing::info!(
        store = backend,
        redis = %config.store.display_address(),
        tls = config.store.uses_tls(),
        origins = ?config.allowed_origins,
        "Config loaded"
    );

    let jwt = match JwtService::new(config.jwt.clone()) {
        Ok(jwt) => jwt,
        Err(e) => {
            tracing::error!(error = %e, "Invalid JWT configuration");
            std::process::exit(1);
        }
    };

    let credentials = match config.credentials.build() {
        Ok(credentials) => credentials,
        Err(e) => {
            tracing::error!(error = %e, "Invalid credential configuration");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn SessionStore> = if config.uses_memory_store() {
        tracing::warn!("Using in-process session store; tokens are not shared between replicas");
        Arc::new(MemoryStore::new())
    } else {
        let redis = match RedisStore::new(&config.store) {
            Ok(redis) => redis,
            Err(e) => {
                tracing::error!(error = %e, "Invalid Redis configuration");
                std::process::exit(1);
            }
        };
        // Start degraded rather than exit; /health reports the outage
        if let Err(e) = redis.connect().await {
            tracing::warn!(error = %e, "Redis not reachable at startup");
        }
        Arc::new(redis)
    };

    let authority = TokenAuthority::new(jwt, store, config.authority.clone());
    let state = AuthApiState {
        session_service: SessionService::new(authority, credentials),
    };
    let app = app_router(state, &config.allowed_origins);

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!("listening on http://{}", &addr);

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }

    tracing::info!("Shut down");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
