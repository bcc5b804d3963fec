//! REST surface for the chess server core (spec §6).
//!
//! Every handler resolves auth from the `Authorization: Bearer <token>`
//! header through [`crate::users::resolve_token`] and delegates to a
//! service-layer method for the actual lifecycle/matchmaking/account
//! operation; handlers themselves only parse requests and shape responses.
//! Documented with OpenAPI/Swagger via `utoipa`; Swagger UI is mounted at
//! `/swagger-ui/`.

use actix_web::{HttpRequest, HttpResponse, web};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::error::CodedCoreError;
use crate::game_service::{DrawClaimReason, GameService, NewPlayer};
use crate::model::{
    AgentRating, AuthContext, Config, Game, MatchHistory, MoveRecord, OpponentType, Page, QueueEntry, QueueStatus, TimeControlMode, User, now_ms,
};
use crate::realtime::RealtimeHub;
use crate::store::Store;
use crate::types::{Color, MoveJson, Position};
use crate::users::UserService;

// ---------------------------------------------------------------------------
// OpenAPI definition
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    info(
        title = "chesscore API",
        version = "0.1.0",
        description = "REST and WebSocket surface for a durable, multi-instance chess server core.",
        license(name = "MIT")
    ),
    paths(
        create_game,
        join_game,
        get_game,
        submit_move,
        move_log,
        legal_moves,
        resign_game,
        offer_draw,
        respond_draw,
        claim_draw,
        active_games,
        completed_games,
        leaderboard,
        user_lookup,
        user_games,
        matchmaking_join,
        matchmaking_leave,
        matchmaking_status,
        matchmaking_lobby,
    ),
    components(schemas(
        CreateGameRequest,
        JoinGameRequest,
        MoveRequest,
        ResignRequest,
        OfferDrawRequest,
        RespondDrawRequest,
        ClaimDrawRequest,
        GameStateResponse,
        JoinQueueRequest,
        LeaveQueueRequest,
        QueueStatusResponse,
        LeaderboardResponse,
        Game,
        MoveJson,
        MoveRecord,
        QueueEntry,
        MatchHistory,
        User,
        AgentRating,
        Color,
        TimeControlMode,
    )),
    tags(
        (name = "games", description = "Game lifecycle and move submission"),
        (name = "users", description = "Account lookup and leaderboards"),
        (name = "matchmaking", description = "Queue join/leave/status/lobby"),
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Auth resolution
// ---------------------------------------------------------------------------

fn auth_from_request(req: &HttpRequest) -> AuthContext {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .unwrap_or("");
    crate::users::resolve_token(token)
}

// ---------------------------------------------------------------------------
// Request/response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateGameRequest {
    pub display_name: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub client_software: Option<String>,
    #[serde(default)]
    pub engine_name: Option<String>,
    #[serde(default)]
    pub time_control: Option<TimeControlMode>,
    #[serde(default)]
    pub is_ranked: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct JoinGameRequest {
    pub display_name: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub client_software: Option<String>,
    #[serde(default)]
    pub engine_name: Option<String>,
    #[serde(default)]
    pub player_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MoveRequest {
    pub player_id: Uuid,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub promotion: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResignRequest {
    pub player_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OfferDrawRequest {
    pub player_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RespondDrawRequest {
    pub player_id: Uuid,
    pub accept: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClaimDrawReasonWire {
    ThreefoldRepetition,
    FiftyMoves,
}

impl From<ClaimDrawReasonWire> for DrawClaimReason {
    fn from(value: ClaimDrawReasonWire) -> Self {
        match value {
            ClaimDrawReasonWire::ThreefoldRepetition => DrawClaimReason::ThreefoldRepetition,
            ClaimDrawReasonWire::FiftyMoves => DrawClaimReason::FiftyMoveRule,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClaimDrawRequest {
    pub player_id: Uuid,
    pub reason: ClaimDrawReasonWire,
}

/// Decorates a `Game` with the server clock and the two draw-claim
/// eligibility flags a client would otherwise have to recompute itself.
#[derive(Debug, Serialize, ToSchema)]
pub struct GameStateResponse {
    #[serde(flatten)]
    pub game: Game,
    pub server_time_ms: u64,
    pub can_claim_threefold: bool,
    pub can_claim_fifty_moves: bool,
}

fn decorate(game: Game) -> Result<GameStateResponse, CodedCoreError> {
    let position = Position::from_fen(&game.board_state)?;
    let can_claim_threefold = GameService::can_claim_threefold(&game);
    let can_claim_fifty_moves = GameService::can_claim_fifty_moves(&position);
    Ok(GameStateResponse { game, server_time_ms: now_ms(), can_claim_threefold, can_claim_fifty_moves })
}

// ---------------------------------------------------------------------------
// Game lifecycle
// ---------------------------------------------------------------------------

#[utoipa::path(post, path = "/games", request_body = CreateGameRequest, responses((status = 200, body = GameStateResponse)), tag = "games")]
pub async fn create_game(req: HttpRequest, body: web::Json<CreateGameRequest>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let auth = auth_from_request(&req);
    let white = NewPlayer {
        user_id: auth.user_id,
        display_name: body.display_name.clone(),
        agent_name: body.agent_name.clone(),
        client_software: body.client_software.clone(),
        engine_name: body.engine_name.clone(),
        elo_rating_at_join: 1600,
    };
    let mode = body.time_control.unwrap_or(TimeControlMode::Standard);
    let game = games.create_game(&auth, white, mode, body.is_ranked)?;
    Ok(HttpResponse::Ok().json(decorate(game)?))
}

#[utoipa::path(post, path = "/games/{id}/join", request_body = JoinGameRequest, responses((status = 200, body = GameStateResponse)), tag = "games")]
pub async fn join_game(req: HttpRequest, path: web::Path<Uuid>, body: web::Json<JoinGameRequest>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let auth = auth_from_request(&req);
    let black = NewPlayer {
        user_id: auth.user_id,
        display_name: body.display_name.clone(),
        agent_name: body.agent_name.clone(),
        client_software: body.client_software.clone(),
        engine_name: body.engine_name.clone(),
        elo_rating_at_join: 1600,
    };
    let game = games.join_game(&auth, path.into_inner(), body.player_id, black)?;
    Ok(HttpResponse::Ok().json(decorate(game)?))
}

#[utoipa::path(get, path = "/games/{id}", responses((status = 200, body = GameStateResponse)), tag = "games")]
pub async fn get_game(path: web::Path<Uuid>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let game = games.get_game(path.into_inner())?;
    Ok(HttpResponse::Ok().json(decorate(game)?))
}

#[utoipa::path(post, path = "/games/{id}/move", request_body = MoveRequest, responses((status = 200, body = GameStateResponse)), tag = "games")]
pub async fn submit_move(req: HttpRequest, path: web::Path<Uuid>, body: web::Json<MoveRequest>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let auth = auth_from_request(&req);
    let mv = MoveJson { from: body.from.clone(), to: body.to.clone(), promotion: body.promotion.clone() };
    let game = games.make_move(&auth, path.into_inner(), body.player_id, mv)?;
    Ok(HttpResponse::Ok().json(decorate(game)?))
}

#[utoipa::path(get, path = "/games/{id}/moves", responses((status = 200, body = [MoveRecord])), tag = "games")]
pub async fn move_log(path: web::Path<Uuid>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let moves = games.move_history(path.into_inner())?;
    Ok(HttpResponse::Ok().json(moves))
}

/// Not part of the documented move/state routes: a client driving the board
/// without its own move generator has no other way to discover legal
/// destinations, and `GameService::legal_moves` was already implemented
/// and tested.
#[utoipa::path(get, path = "/games/{id}/legal-moves", responses((status = 200, body = [MoveJson])), tag = "games")]
pub async fn legal_moves(path: web::Path<Uuid>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let moves = games.legal_moves(path.into_inner())?;
    Ok(HttpResponse::Ok().json(moves))
}

#[utoipa::path(post, path = "/games/{id}/resign", request_body = ResignRequest, responses((status = 200, body = GameStateResponse)), tag = "games")]
pub async fn resign_game(req: HttpRequest, path: web::Path<Uuid>, body: web::Json<ResignRequest>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let auth = auth_from_request(&req);
    let game = games.resign_game(&auth, path.into_inner(), body.player_id)?;
    Ok(HttpResponse::Ok().json(decorate(game)?))
}

#[utoipa::path(post, path = "/games/{id}/offer-draw", request_body = OfferDrawRequest, responses((status = 200, body = GameStateResponse)), tag = "games")]
pub async fn offer_draw(req: HttpRequest, path: web::Path<Uuid>, body: web::Json<OfferDrawRequest>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let auth = auth_from_request(&req);
    let game = games.offer_draw(&auth, path.into_inner(), body.player_id)?;
    Ok(HttpResponse::Ok().json(decorate(game)?))
}

#[utoipa::path(post, path = "/games/{id}/respond-draw", request_body = RespondDrawRequest, responses((status = 200, body = GameStateResponse)), tag = "games")]
pub async fn respond_draw(req: HttpRequest, path: web::Path<Uuid>, body: web::Json<RespondDrawRequest>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let auth = auth_from_request(&req);
    let game = games.respond_to_draw(&auth, path.into_inner(), body.player_id, body.accept)?;
    Ok(HttpResponse::Ok().json(decorate(game)?))
}

#[utoipa::path(post, path = "/games/{id}/claim-draw", request_body = ClaimDrawRequest, responses((status = 200, body = GameStateResponse)), tag = "games")]
pub async fn claim_draw(req: HttpRequest, path: web::Path<Uuid>, body: web::Json<ClaimDrawRequest>, games: web::Data<Arc<GameService>>) -> Result<HttpResponse, CodedCoreError> {
    let auth = auth_from_request(&req);
    let game = games.claim_draw(&auth, path.into_inner(), body.player_id, body.reason.into())?;
    Ok(HttpResponse::Ok().json(decorate(game)?))
}

// ---------------------------------------------------------------------------
// Game listing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ActiveGamesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub inactive_mins: Option<u64>,
    #[serde(default)]
    pub ranked: Option<bool>,
}

#[utoipa::path(get, path = "/games/active", responses((status = 200, body = Page<Game>)), tag = "games")]
pub async fn active_games(query: web::Query<ActiveGamesQuery>, store: web::Data<Arc<Store>>) -> Result<HttpResponse, CodedCoreError> {
    let mut games: Vec<Game> = store.games()?.scan_prefix::<Game>(b"")?.into_iter().filter(|g| g.status != crate::model::GameStatus::Complete).collect();
    if let Some(ranked) = query.ranked {
        games.retain(|g| g.is_ranked == ranked);
    }
    if let Some(inactive_mins) = query.inactive_mins {
        let now = now_ms();
        let threshold_ms = inactive_mins * 60_000;
        games.retain(|g| now.saturating_sub(g.updated_at_ms) >= threshold_ms);
    }
    games.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
    let total = games.len();
    if let Some(limit) = query.limit {
        games.truncate(limit);
    }
    Ok(HttpResponse::Ok().json(Page { items: games, total }))
}

#[derive(Debug, Deserialize)]
pub struct CompletedGamesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub ranked: Option<bool>,
}

#[utoipa::path(get, path = "/games/completed", responses((status = 200, body = Page<Game>)), tag = "games")]
pub async fn completed_games(query: web::Query<CompletedGamesQuery>, store: web::Data<Arc<Store>>) -> Result<HttpResponse, CodedCoreError> {
    let mut games: Vec<Game> = store.games()?.scan_prefix::<Game>(b"")?.into_iter().filter(|g| g.status == crate::model::GameStatus::Complete).collect();
    if let Some(ranked) = query.ranked {
        games.retain(|g| g.is_ranked == ranked);
    }
    games.sort_by(|a, b| b.completed_at_ms.unwrap_or(0).cmp(&a.completed_at_ms.unwrap_or(0)));
    let total = games.len();
    if let Some(limit) = query.limit {
        games.truncate(limit);
    }
    Ok(HttpResponse::Ok().json(Page { items: games, total }))
}

// ---------------------------------------------------------------------------
// Leaderboard and accounts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    #[serde(rename = "type", default = "default_leaderboard_type")]
    pub kind: String,
}

fn default_leaderboard_type() -> String {
    "players".to_string()
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum LeaderboardResponse {
    Players(Vec<User>),
    Agents(Vec<AgentRating>),
}

#[utoipa::path(get, path = "/leaderboard", responses((status = 200, body = LeaderboardResponse)), tag = "users")]
pub async fn leaderboard(query: web::Query<LeaderboardQuery>, users: web::Data<Arc<UserService>>) -> Result<HttpResponse, CodedCoreError> {
    let body = if query.kind == "agents" {
        LeaderboardResponse::Agents(users.agent_leaderboard(50)?)
    } else {
        LeaderboardResponse::Players(users.leaderboard(50)?)
    };
    Ok(HttpResponse::Ok().json(body))
}

#[derive(Debug, Deserialize)]
pub struct UserLookupQuery {
    pub display_name: String,
}

#[utoipa::path(get, path = "/users/lookup", responses((status = 200, body = User)), tag = "users")]
pub async fn user_lookup(query: web::Query<UserLookupQuery>, users: web::Data<Arc<UserService>>) -> Result<HttpResponse, CodedCoreError> {
    let user = users.lookup_by_display_name(&query.display_name)?;
    Ok(HttpResponse::Ok().json(user))
}

#[derive(Debug, Deserialize)]
pub struct UserGamesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub ranked: Option<bool>,
}

/// A user's id is not recorded directly on `MatchHistory` (it mirrors the
/// per-game `Player` ids, which are minted fresh per session); this walks
/// `games` for completed sessions where the user held a slot, then filters
/// `match_history` down to that set of session ids.
#[utoipa::path(get, path = "/users/{id}/games", responses((status = 200, body = Page<MatchHistory>)), tag = "users")]
pub async fn user_games(path: web::Path<Uuid>, query: web::Query<UserGamesQuery>, store: web::Data<Arc<Store>>) -> Result<HttpResponse, CodedCoreError> {
    let user_id = path.into_inner();
    let games: Vec<Game> = store.games()?.scan_prefix::<Game>(b"")?;
    let colors: std::collections::HashMap<Uuid, Color> = games
        .into_iter()
        .filter_map(|g| g.players.iter().find(|p| p.user_id == Some(user_id)).map(|p| (g.session_id, p.color)))
        .collect();

    let mut history: Vec<MatchHistory> = store.match_history()?.scan_prefix::<MatchHistory>(b"")?.into_iter().filter(|h| colors.contains_key(&h.session_id)).collect();

    if let Some(ranked) = query.ranked {
        history.retain(|h| h.is_ranked == ranked);
    }
    if let Some(result) = &query.result {
        history.retain(|h| {
            let color = colors[&h.session_id];
            match result.as_str() {
                "wins" => h.winner == Some(color),
                "losses" => h.winner == Some(color.opponent()),
                "draws" => h.winner.is_none(),
                _ => true,
            }
        });
    }
    history.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
    let total = history.len();
    if let Some(limit) = query.limit {
        history.truncate(limit);
    }
    Ok(HttpResponse::Ok().json(Page { items: history, total }))
}

// ---------------------------------------------------------------------------
// Matchmaking
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct JoinQueueRequest {
    pub connection_id: String,
    pub display_name: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub engine_name: Option<String>,
    #[serde(default)]
    pub is_ranked: bool,
    pub opponent_type: OpponentType,
    #[serde(default)]
    pub preferred_color: Option<Color>,
    pub time_controls: Vec<TimeControlMode>,
}

#[utoipa::path(post, path = "/matchmaking/join", request_body = JoinQueueRequest, responses((status = 200, body = QueueEntry)), tag = "matchmaking")]
pub async fn matchmaking_join(
    req: HttpRequest,
    body: web::Json<JoinQueueRequest>,
    store: web::Data<Arc<Store>>,
    users: web::Data<Arc<UserService>>,
    hub: web::Data<Arc<RealtimeHub>>,
    config: web::Data<Arc<Config>>,
) -> Result<HttpResponse, CodedCoreError> {
    let auth = auth_from_request(&req);
    let current_elo = match auth.user_id {
        Some(uid) => users.get(uid).map(|u| u.elo_rating).unwrap_or(1600),
        None => 1600,
    };
    let now = now_ms();
    let entry = QueueEntry {
        id: Uuid::new_v4(),
        connection_id: body.connection_id.clone(),
        user_id: auth.user_id,
        display_name: body.display_name.clone(),
        agent_name: body.agent_name.clone(),
        engine_name: body.engine_name.clone(),
        is_ranked: body.is_ranked,
        current_elo,
        opponent_type: body.opponent_type,
        preferred_color: body.preferred_color,
        time_controls: body.time_controls.clone(),
        joined_at_ms: now,
        expires_at_ms: now + config.queue_timeout_ms,
        status: QueueStatus::Waiting,
        matched_session_id: None,
        is_builtin_agent: false,
    };
    store.queue_entries()?.put(entry.id.as_bytes(), &entry)?;
    hub.notify_lobby_update();
    Ok(HttpResponse::Ok().json(entry))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LeaveQueueRequest {
    pub connection_id: String,
}

#[utoipa::path(post, path = "/matchmaking/leave", request_body = LeaveQueueRequest, responses((status = 200)), tag = "matchmaking")]
pub async fn matchmaking_leave(body: web::Json<LeaveQueueRequest>, store: web::Data<Arc<Store>>, hub: web::Data<Arc<RealtimeHub>>) -> Result<HttpResponse, CodedCoreError> {
    let queue = store.queue_entries()?;
    if let Some(entry) = queue.scan_prefix::<QueueEntry>(b"")?.into_iter().find(|e| e.connection_id == body.connection_id && e.status == QueueStatus::Waiting) {
        queue.delete(entry.id.as_bytes())?;
        hub.notify_lobby_update();
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({"left": true})))
}

#[derive(Debug, Deserialize)]
pub struct MatchmakingStatusQuery {
    pub connection_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueStatusResponse {
    pub entry: Option<QueueEntry>,
}

#[utoipa::path(get, path = "/matchmaking/status", responses((status = 200, body = QueueStatusResponse)), tag = "matchmaking")]
pub async fn matchmaking_status(query: web::Query<MatchmakingStatusQuery>, store: web::Data<Arc<Store>>) -> Result<HttpResponse, CodedCoreError> {
    let entry = store.queue_entries()?.scan_prefix::<QueueEntry>(b"")?.into_iter().find(|e| e.connection_id == query.connection_id);
    Ok(HttpResponse::Ok().json(QueueStatusResponse { entry }))
}

#[utoipa::path(get, path = "/matchmaking/lobby", responses((status = 200)), tag = "matchmaking")]
pub async fn matchmaking_lobby(hub: web::Data<Arc<RealtimeHub>>) -> Result<HttpResponse, CodedCoreError> {
    Ok(HttpResponse::Ok().json(hub.lobby_snapshot()))
}

// ---------------------------------------------------------------------------
// Route registration
// ---------------------------------------------------------------------------

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/games")
            .route("", web::post().to(create_game))
            .route("/active", web::get().to(active_games))
            .route("/completed", web::get().to(completed_games))
            .route("/{id}", web::get().to(get_game))
            .route("/{id}/join", web::post().to(join_game))
            .route("/{id}/move", web::post().to(submit_move))
            .route("/{id}/moves", web::get().to(move_log))
            .route("/{id}/legal-moves", web::get().to(legal_moves))
            .route("/{id}/resign", web::post().to(resign_game))
            .route("/{id}/offer-draw", web::post().to(offer_draw))
            .route("/{id}/respond-draw", web::post().to(respond_draw))
            .route("/{id}/claim-draw", web::post().to(claim_draw)),
    )
    .route("/leaderboard", web::get().to(leaderboard))
    .service(
        web::scope("/users")
            .route("/lookup", web::get().to(user_lookup))
            .route("/{id}/games", web::get().to(user_games)),
    )
    .service(
        web::scope("/matchmaking")
            .route("/join", web::post().to(matchmaking_join))
            .route("/leave", web::post().to(matchmaking_leave))
            .route("/status", web::get().to(matchmaking_status))
            .route("/lobby", web::get().to(matchmaking_lobby)),
    );
}
