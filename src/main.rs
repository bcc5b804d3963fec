//! chesscore — server core for a multiplayer chess platform.
//!
//! Provides a REST + WebSocket API for creating games, submitting moves,
//! matchmaking, and spectating, backed by durable `sled` storage so a
//! process restart loses no active game. Agents (human clients and the
//! resident built-in bot alike) all speak the same public HTTP/WS surface;
//! see `api.rs` for the route table and `realtime.rs` for the WebSocket
//! message taxonomy.
//!
//! ## Usage
//!
//! ```bash
//! chesscore serve
//! chesscore serve --port 3000 --data-dir ./data
//! ```

pub mod agent;
pub mod api;
pub mod clock;
pub mod completion;
pub mod elo;
pub mod error;
pub mod eventbus;
pub mod game_service;
pub mod matchmaker;
pub mod model;
pub mod realtime;
pub mod rules;
pub mod storage;
pub mod store;
pub mod types;
pub mod users;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::agent::AgentPool;
use crate::api::ApiDoc;
use crate::clock::ClockService;
use crate::eventbus::EventBus;
use crate::game_service::{GameService, NotificationSink};
use crate::matchmaker::Matchmaker;
use crate::model::Config;
use crate::realtime::RealtimeHub;
use crate::storage::ArchiveStore;
use crate::store::Store;

/// chesscore — server core for a multiplayer chess platform.
#[derive(Parser, Debug)]
#[command(name = "chesscore")]
#[command(about = "Chess platform server core — rules engine, matchmaking, and realtime fan-out")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the REST + WebSocket server with Swagger UI.
    Serve {
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Directory for durable storage (active games, users, archives).
        #[arg(long, default_value = "data")]
        data_dir: String,

        /// Matchmaker pairing tick interval, in milliseconds.
        #[arg(long, default_value_t = 2_000)]
        matchmaker_tick_ms: u64,

        /// Clock deduction tick interval, in milliseconds.
        #[arg(long, default_value_t = 1_000)]
        clock_tick_ms: u64,

        /// Unmatched queue entries older than this are expired, in milliseconds.
        #[arg(long, default_value_t = 5 * 60_000)]
        queue_timeout_ms: u64,

        /// Per-game position-history cap used for threefold-repetition checks.
        #[arg(long, default_value_t = 300)]
        position_history_cap: usize,
    },
}

/// Composes the realtime hub and the built-in agent pool behind the single
/// [`NotificationSink`] seam `GameService`/`Matchmaker` depend on, so
/// neither lifecycle module needs to know both exist.
struct ServerNotifier {
    hub: Arc<RealtimeHub>,
    agents: Arc<AgentPool>,
}

impl NotificationSink for ServerNotifier {
    fn broadcast(&self, session_id: Uuid, event: serde_json::Value, exclude_player_id: Option<Uuid>) {
        self.hub.broadcast(session_id, event, exclude_player_id);
    }

    fn notify_agent_turn(&self, session_id: Uuid, _player_id: Uuid) {
        self.agents.notify_turn(session_id);
    }

    fn notify_match_found(&self, connection_id: &str, session_id: Uuid, color: crate::types::Color) {
        self.hub.notify_match_found(connection_id, session_id, color);
    }

    fn notify_lobby_update(&self) {
        self.hub.notify_lobby_update();
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host, data_dir, matchmaker_tick_ms, clock_tick_ms, queue_timeout_ms, position_history_cap } => {
            let config = Config { host, port, data_dir, matchmaker_tick_ms, queue_timeout_ms, position_history_cap, clock_tick_ms, ..Config::default() };
            run_server(config).await
        }
    }
}

/// Wires storage, the clock/matchmaker/eventbus background loops, the
/// built-in agent pool, and the HTTP + WebSocket routes, then serves until
/// the process receives a shutdown signal.
async fn run_server(config: Config) -> std::io::Result<()> {
    let openapi = ApiDoc::openapi();

    let store = Arc::new(Store::open(&config.data_dir).map_err(std::io::Error::other)?);
    let archive = Arc::new(ArchiveStore::new(&config.data_dir)?);
    let hub = RealtimeHub::new(Some(store.clone()), config.instance_id);
    let (clock, timeout_rx) = ClockService::new();

    let agent_user_id = Uuid::new_v4();
    let base_url = format!("http://127.0.0.1:{}", config.port);
    let agents = Arc::new(AgentPool::new(base_url, agent_user_id));

    let notifier: Arc<dyn NotificationSink> = Arc::new(ServerNotifier { hub: hub.clone(), agents: agents.clone() });

    let games = Arc::new(GameService::new(store.clone(), clock.clone(), notifier.clone(), Some(archive.clone()), config.position_history_cap));
    let matchmaker = Arc::new(Matchmaker::new(store.clone(), games.clone(), notifier.clone(), agents.clone(), config.instance_id));
    let event_bus = EventBus::new(Some(store.clone()), hub.clone(), config.instance_id);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    if let Err(e) = games.rebuild_clocks_on_boot() {
        log::warn!("failed to rebuild clocks from persisted games: {e}");
    }
    agents.resume_active_games(&store).await;

    tokio::spawn(matchmaker.clone().run(config.matchmaker_tick_ms, shutdown_rx.clone()));
    tokio::spawn(clock.clone().run(config.clock_tick_ms, hub.clone(), shutdown_rx.clone()));
    tokio::spawn(event_bus.run(shutdown_rx.clone()));
    tokio::spawn(run_timeout_consumer(games.clone(), timeout_rx, shutdown_rx.clone()));

    let store_data = web::Data::new(store.clone());
    let games_data = web::Data::new(games.clone());
    let matchmaker_data = web::Data::new(matchmaker.clone());
    let hub_data = web::Data::new(hub.clone());
    let config_data = web::Data::new(Arc::new(config.clone()));
    let agents_data = web::Data::new(agents.clone());
    let users_data = web::Data::new(Arc::new(users::UserService::new(store.clone())));

    log::info!("starting chesscore server on {}:{}", config.host, config.port);
    log::info!("durable storage directory: {}", config.data_dir);
    log::info!("swagger UI available at http://{}:{}/swagger-ui/", config.host, config.port);

    let host = config.host.clone();
    let port = config.port;

    let server = HttpServer::new(move || {
        let cors = Cors::default().allow_any_origin().allow_any_method().allow_any_header().max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(store_data.clone())
            .app_data(games_data.clone())
            .app_data(matchmaker_data.clone())
            .app_data(hub_data.clone())
            .app_data(config_data.clone())
            .app_data(agents_data.clone())
            .app_data(users_data.clone())
            .configure(api::configure_routes)
            .route("/ws/games/{id}", web::get().to(realtime::ws_connect_game))
            .route("/ws/matchmaking/{connection_id}", web::get().to(realtime::ws_connect_matchmaking))
            .route("/ws/lobby", web::get().to(realtime::ws_connect_lobby))
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()))
    })
    .bind((host.as_str(), port))?
    .run();

    let result = server.await;
    let _ = shutdown_tx.send(true);
    result
}

/// Drains clock timeouts and resolves them through the same lifecycle path
/// a client-triggered move would, so a timeout is never a special case for
/// completion bookkeeping or broadcast.
async fn run_timeout_consumer(games: Arc<GameService>, mut timeout_rx: tokio::sync::mpsc::UnboundedReceiver<clock::TimeoutEvent>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        tokio::select! {
            event = timeout_rx.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = games.force_timeout(event.session_id, event.winner) {
                    log::warn!("failed to resolve timeout for {}: {e}", event.session_id);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    log::info!("timeout consumer shutting down");
                    break;
                }
            }
        }
    }
}
