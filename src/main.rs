//! Gateway server binary: parse configuration, wire up the dispatch
//! plane, serve until a shutdown signal, then drain background tasks.
//! Exits 0 on clean shutdown, 1 on unrecoverable startup errors.

use llm_gateway::{create_router, shutdown, AppState, Config};
use std::net::{IpAddr, SocketAddr};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Invalid configuration already exits 1 inside parse_args.
    let config = Config::parse_args();
    let host = config.host.clone();
    let port = config.port;

    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(err) => {
            error!("failed to initialize gateway state: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = state.start_background() {
        error!("failed to start background tasks: {}", err);
        std::process::exit(1);
    }

    let ip: IpAddr = match host.as_str() {
        "localhost" => IpAddr::from([127, 0, 0, 1]),
        other => match other.parse() {
            Ok(ip) => ip,
            Err(err) => {
                error!("invalid bind host '{}': {}", host, err);
                std::process::exit(1);
            }
        },
    };
    let addr = SocketAddr::new(ip, port);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", addr, err);
            std::process::exit(1);
        }
    };

    info!("llm-gateway listening on http://{}", addr);
    info!(
        "dispatching to {} backend(s), strategy {}",
        state.registry.len(),
        state.balancer.strategy()
    );

    let app = create_router(state.clone());
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown::wait_for_signal());

    if let Err(err) = serve.await {
        error!("server error: {}", err);
        std::process::exit(1);
    }

    state.supervisor.shutdown().await;
    info!("shutdown complete");
}
