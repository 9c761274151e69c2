use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use tower_http::trace::TraceLayer;

use callserver::api_router::configure_routes;
use callserver::config::AppConfig;
use callserver::followup::spawn_follow_up_sweeper;
use callserver::outbound::worker::spawn_queue_worker;
use callserver::shared::db::{open_conn, run_migrations};
use callserver::shared::state::AppState;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    info!("starting callserver {}", env!("CARGO_PKG_VERSION"));

    // Schema first; nothing else may touch the database before this.
    {
        let mut conn = match open_conn(&config.database_path) {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("database error: {e:#}");
                std::process::exit(1);
            }
        };
        if let Err(e) = run_migrations(&mut conn) {
            eprintln!("migration error: {e:#}");
            std::process::exit(1);
        }
        if let Err(e) = callserver::reps::seed_from_env(&mut conn, &config) {
            error!("sales rep seeding failed: {e:#}");
        }
    }

    let port = config.server_port;
    let state = Arc::new(AppState::new(config));

    spawn_queue_worker(state.clone());
    spawn_follow_up_sweeper(state.clone());

    let app = configure_routes(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
