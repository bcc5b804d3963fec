//! Realtime fan-out (spec §4.7): per-instance registries for players,
//! spectators, matchmaking clients, and lobby subscribers, plus the
//! per-connection WebSocket actor. The single game-scoped broadcaster
//! actor becomes a plain `RealtimeHub` guarded by `parking_lot::RwLock`
//! (no mailbox round-trip needed to read or mutate a registry), while
//! `WsSession` keeps an actor-per-connection shape.
//!
//! Clients here never submit game commands over the socket — every
//! state-changing operation is plain HTTP (§6); the realtime layer only
//! pushes events and holds the four registries.

use actix::{Actor, ActorContext, Addr, AsyncContext, Handler, Message};
use actix_web::{HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::model::{QueueEntry, QueueStatus, WsEvent, WsEventType, now_ms};
use crate::store::Store;
use crate::types::Color;

/// Server-originated ping cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A client that hasn't answered a ping within this window is reaped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-client outstanding-message bound. A client that cannot keep up is
/// dead and removed rather than left to back-pressure the whole hub.
const MAX_PENDING: usize = 64;

/// Internal message: deliver a text frame to a single `WsSession`.
#[derive(Message)]
#[rtype(result = "()")]
pub struct WsText(pub String);

/// A registry entry: where to send, and how many sends are in flight.
#[derive(Clone)]
struct ClientHandle {
    addr: Addr<WsSession>,
    pending: Arc<AtomicUsize>,
}

impl ClientHandle {
    /// Attempts delivery. Returns `false` (and does not deliver) once the
    /// client already has `MAX_PENDING` messages outstanding, marking it
    /// a candidate for the registry's dead-client sweep.
    fn send(&self, text: String) -> bool {
        let prior = self.pending.fetch_add(1, Ordering::SeqCst);
        if prior >= MAX_PENDING {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            self.addr.do_send(WsText(text));
            true
        }
    }
}

/// Owns the four realtime registries described in spec §4.7, plus the
/// optional link to the shared store used to publish cross-instance
/// events (§4.8) and to render lobby snapshots.
pub struct RealtimeHub {
    players: RwLock<HashMap<Uuid, HashMap<Uuid, ClientHandle>>>,
    spectators: RwLock<HashMap<Uuid, HashMap<Uuid, ClientHandle>>>,
    matchmaking: RwLock<HashMap<String, ClientHandle>>,
    lobby: RwLock<HashMap<Uuid, ClientHandle>>,
    store: Option<Arc<Store>>,
    instance_id: Uuid,
}

impl RealtimeHub {
    pub fn new(store: Option<Arc<Store>>, instance_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            players: RwLock::new(HashMap::new()),
            spectators: RwLock::new(HashMap::new()),
            matchmaking: RwLock::new(HashMap::new()),
            lobby: RwLock::new(HashMap::new()),
            store,
            instance_id,
        })
    }

    fn register_player(&self, session_id: Uuid, player_id: Uuid, handle: ClientHandle) {
        self.players.write().entry(session_id).or_default().insert(player_id, handle);
    }

    fn unregister_player(&self, session_id: Uuid, player_id: Uuid) {
        let mut players = self.players.write();
        if let Some(slots) = players.get_mut(&session_id) {
            slots.remove(&player_id);
            if slots.is_empty() {
                players.remove(&session_id);
            }
        }
    }

    fn register_spectator(&self, session_id: Uuid, connection_id: Uuid, handle: ClientHandle) {
        self.spectators.write().entry(session_id).or_default().insert(connection_id, handle);
    }

    fn unregister_spectator(&self, session_id: Uuid, connection_id: Uuid) {
        let mut spectators = self.spectators.write();
        if let Some(conns) = spectators.get_mut(&session_id) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                spectators.remove(&session_id);
            }
        }
    }

    fn register_matchmaking(&self, connection_id: String, handle: ClientHandle) {
        self.matchmaking.write().insert(connection_id, handle);
    }

    fn unregister_matchmaking(&self, connection_id: &str) {
        self.matchmaking.write().remove(connection_id);
    }

    fn register_lobby(&self, connection_id: Uuid, handle: ClientHandle) {
        self.lobby.write().insert(connection_id, handle);
    }

    fn unregister_lobby(&self, connection_id: Uuid) {
        self.lobby.write().remove(&connection_id);
    }

    /// Delivers `text` to every entry in `map`, then evicts everyone whose
    /// queue was already full: a read-locked fan-out phase followed by a
    /// short write-locked cleanup phase, per spec §4.7/§5.
    fn fan_out<K: std::hash::Hash + Eq + Clone>(map: &RwLock<HashMap<K, ClientHandle>>, text: &str, skip: Option<&K>) {
        let mut dead = Vec::new();
        {
            let guard = map.read();
            for (key, handle) in guard.iter() {
                if skip.is_some_and(|s| s == key) {
                    continue;
                }
                if !handle.send(text.to_string()) {
                    dead.push(key.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut guard = map.write();
            for key in dead {
                guard.remove(&key);
            }
        }
    }

    /// Session-scoped broadcast to every registered player and spectator.
    /// Cross-instance replication is skipped for `time_update` (Open
    /// Question (a): high-frequency clock ticks stay instance-local).
    pub fn broadcast(&self, session_id: Uuid, event: serde_json::Value, exclude_player_id: Option<Uuid>) {
        self.local_broadcast(session_id, &event, exclude_player_id);
        let is_time_update = event.get("type").and_then(|t| t.as_str()) == Some("time_update");
        if !is_time_update {
            self.publish_event(WsEvent {
                id: Uuid::new_v4(),
                origin_instance_id: self.instance_id,
                event_type: WsEventType::Broadcast,
                session_id: Some(session_id),
                payload: Some(event),
                exclude_player_id,
                connection_id: None,
                match_session_id: None,
                created_at_ms: now_ms(),
            });
        }
    }

    /// Local-only variant used by the clock ticker for `time_update`
    /// frames, which never cross the event bus.
    pub fn broadcast_local_only(&self, session_id: Uuid, event: serde_json::Value) {
        self.local_broadcast(session_id, &event, None);
    }

    fn local_broadcast(&self, session_id: Uuid, event: &serde_json::Value, exclude_player_id: Option<Uuid>) {
        let text = event.to_string();
        if let Some(slots) = self.players.read().get(&session_id) {
            let mut dead = Vec::new();
            for (player_id, handle) in slots.iter() {
                if Some(*player_id) == exclude_player_id {
                    continue;
                }
                if !handle.send(text.clone()) {
                    dead.push(*player_id);
                }
            }
            if !dead.is_empty() {
                if let Some(slots) = self.players.write().get_mut(&session_id) {
                    for player_id in dead {
                        slots.remove(&player_id);
                    }
                }
            }
        }
        if let Some(conns) = self.spectators.read().get(&session_id) {
            let mut dead = Vec::new();
            for (connection_id, handle) in conns.iter() {
                if !handle.send(text.clone()) {
                    dead.push(*connection_id);
                }
            }
            if !dead.is_empty() {
                if let Some(conns) = self.spectators.write().get_mut(&session_id) {
                    for connection_id in dead {
                        conns.remove(&connection_id);
                    }
                }
            }
        }
    }

    /// Pushes `match_found` directly to a matchmaking client by the
    /// `connectionId` it registered with.
    pub fn notify_match_found(&self, connection_id: &str, session_id: Uuid, color: Color) {
        let event = serde_json::json!({
            "type": "match_found",
            "sessionId": session_id,
            "color": color,
            "serverTime": now_ms(),
        });
        let delivered = self.matchmaking.read().get(connection_id).map(|h| h.send(event.to_string()));
        if delivered == Some(false) {
            self.matchmaking.write().remove(connection_id);
        }
        self.publish_event(WsEvent {
            id: Uuid::new_v4(),
            origin_instance_id: self.instance_id,
            event_type: WsEventType::MatchNotification,
            session_id: None,
            payload: Some(serde_json::json!({ "color": color })),
            exclude_player_id: None,
            connection_id: Some(connection_id.to_string()),
            match_session_id: Some(session_id),
            created_at_ms: now_ms(),
        });
    }

    /// Broadcasts a fresh lobby snapshot to every lobby subscriber and
    /// publishes it for replay on other instances.
    pub fn notify_lobby_update(&self) {
        let snapshot = self.lobby_snapshot();
        Self::fan_out(&self.lobby, &snapshot.to_string(), None);
        self.publish_event(WsEvent {
            id: Uuid::new_v4(),
            origin_instance_id: self.instance_id,
            event_type: WsEventType::Broadcast,
            session_id: None,
            payload: Some(snapshot),
            exclude_player_id: None,
            connection_id: None,
            match_session_id: None,
            created_at_ms: now_ms(),
        });
    }

    /// Renders the current waiting queue as the `lobby_update` payload,
    /// shared by the initial on-subscribe push, [`Self::notify_lobby_update`],
    /// and the `/matchmaking/lobby` HTTP handler.
    pub fn lobby_snapshot(&self) -> serde_json::Value {
        let Some(store) = &self.store else {
            return serde_json::json!({ "type": "lobby_update", "waiting": [], "serverTime": now_ms() });
        };
        let waiting = match store.queue_entries().and_then(|q| q.scan_prefix::<QueueEntry>(b"")) {
            Ok(entries) => entries.into_iter().filter(|e| e.status == QueueStatus::Waiting).collect::<Vec<_>>(),
            Err(e) => {
                log::warn!("failed to read queue entries for lobby snapshot: {e}");
                Vec::new()
            }
        };
        serde_json::json!({ "type": "lobby_update", "waiting": waiting, "serverTime": now_ms() })
    }

    /// Replays an event received from another instance into this
    /// instance's local registries, without re-publishing it (the
    /// `EventBus` watcher calls this; it never sees its own writes).
    pub fn replay(&self, event: &WsEvent) {
        match event.event_type {
            WsEventType::Broadcast => {
                let Some(payload) = event.payload.clone() else { return };
                match event.session_id {
                    Some(session_id) => self.local_broadcast(session_id, &payload, event.exclude_player_id),
                    None => Self::fan_out(&self.lobby, &payload.to_string(), None),
                }
            }
            WsEventType::MatchNotification => {
                let (Some(connection_id), Some(session_id)) = (&event.connection_id, event.match_session_id) else { return };
                let color = event.payload.as_ref().and_then(|p| p.get("color")).and_then(|c| c.as_str());
                let color = match color {
                    Some("black") => Color::Black,
                    _ => Color::White,
                };
                let event = serde_json::json!({ "type": "match_found", "sessionId": session_id, "color": color, "serverTime": now_ms() });
                let delivered = self.matchmaking.read().get(connection_id.as_str()).map(|h| h.send(event.to_string()));
                if delivered == Some(false) {
                    self.matchmaking.write().remove(connection_id);
                }
            }
        }
    }

    fn publish_event(&self, event: WsEvent) {
        let Some(store) = &self.store else { return };
        match store.ws_events().and_then(|c| c.put(event.id.as_bytes(), &event)) {
            Ok(()) => {}
            Err(e) => log::warn!("failed to publish cross-instance event: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// WsSession — per-connection actor
// ---------------------------------------------------------------------------

enum SessionKind {
    Player { session_id: Uuid, player_id: Uuid },
    Spectator { session_id: Uuid },
    Matchmaking { connection_id: String },
    Lobby,
}

/// One WebSocket connection. Push-only: the server sends events and
/// heartbeats; the only inbound frames it expects are pong replies.
pub struct WsSession {
    id: Uuid,
    kind: SessionKind,
    hub: Arc<RealtimeHub>,
    pending: Arc<AtomicUsize>,
    last_heartbeat: Instant,
}

impl WsSession {
    fn new(kind: SessionKind, hub: Arc<RealtimeHub>) -> Self {
        Self { id: Uuid::new_v4(), kind, hub, pending: Arc::new(AtomicUsize::new(0)), last_heartbeat: Instant::now() }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                log::warn!("WS session {} heartbeat timeout, disconnecting", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.start_heartbeat(ctx);
        let handle = ClientHandle { addr: ctx.address(), pending: self.pending.clone() };
        match &self.kind {
            SessionKind::Player { session_id, player_id } => {
                log::info!("player {player_id} connected to session {session_id}");
                self.hub.register_player(*session_id, *player_id, handle);
            }
            SessionKind::Spectator { session_id } => {
                log::info!("spectator {} connected to session {session_id}", self.id);
                self.hub.register_spectator(*session_id, self.id, handle);
            }
            SessionKind::Matchmaking { connection_id } => {
                log::info!("matchmaking client {connection_id} connected");
                self.hub.register_matchmaking(connection_id.clone(), handle);
            }
            SessionKind::Lobby => {
                log::info!("lobby subscriber {} connected", self.id);
                self.hub.register_lobby(self.id, handle);
                ctx.text(self.hub.lobby_snapshot().to_string());
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        match &self.kind {
            SessionKind::Player { session_id, player_id } => self.hub.unregister_player(*session_id, *player_id),
            SessionKind::Spectator { session_id } => self.hub.unregister_spectator(*session_id, self.id),
            SessionKind::Matchmaking { connection_id } => self.hub.unregister_matchmaking(connection_id),
            SessionKind::Lobby => self.hub.unregister_lobby(self.id),
        }
    }
}

impl actix::StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(_)) => {
                // Push-only protocol: clients aren't expected to send
                // commands over this socket (see module docs).
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Binary(_)) | Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                log::warn!("WS session {} protocol error: {e}", self.id);
                ctx.stop();
            }
        }
    }
}

impl Handler<WsText> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: WsText, ctx: &mut Self::Context) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        ctx.text(msg.0);
    }
}

// ---------------------------------------------------------------------------
// HTTP -> WebSocket upgrade handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GameStreamQuery {
    #[serde(default)]
    pub player_id: Option<Uuid>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub spectator: bool,
}

/// `/ws/games/{id}?playerId=&token=` for an authenticated player stream,
/// or `/ws/games/{id}?spectator=true` for a read-only spectator stream.
pub async fn ws_connect_game(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<Uuid>,
    query: web::Query<GameStreamQuery>,
    hub: web::Data<Arc<RealtimeHub>>,
    store: web::Data<Arc<Store>>,
) -> Result<HttpResponse, actix_web::Error> {
    let session_id = path.into_inner();

    if query.spectator {
        let session = WsSession::new(SessionKind::Spectator { session_id }, hub.get_ref().clone());
        return ws::start(session, &req, stream);
    }

    let Some(player_id) = query.player_id else {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({ "error": "missing playerId" })));
    };
    let game = match store.games().and_then(|g| g.get::<crate::model::Game>(session_id.as_bytes())) {
        Ok(Some(g)) => g,
        Ok(None) => return Ok(HttpResponse::NotFound().json(serde_json::json!({ "error": "game not found" }))),
        Err(e) => return Ok(HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))),
    };
    let Some(player) = game.player_by_id(player_id) else {
        return Ok(HttpResponse::NotFound().json(serde_json::json!({ "error": "no such player in this game" })));
    };
    let auth = crate::users::resolve_token(query.token.as_deref().unwrap_or(""));
    if !auth.authorize_slot(player.user_id) {
        return Ok(HttpResponse::Unauthorized().json(serde_json::json!({ "error": "not authorized for this player slot" })));
    }

    let session = WsSession::new(SessionKind::Player { session_id, player_id }, hub.get_ref().clone());
    ws::start(session, &req, stream)
}

/// `/ws/matchmaking/{connectionId}` — receives `match_found`.
pub async fn ws_connect_matchmaking(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    hub: web::Data<Arc<RealtimeHub>>,
) -> Result<HttpResponse, actix_web::Error> {
    let session = WsSession::new(SessionKind::Matchmaking { connection_id: path.into_inner() }, hub.get_ref().clone());
    ws::start(session, &req, stream)
}

/// `/ws/lobby` — receives `lobby_update`.
pub async fn ws_connect_lobby(
    req: HttpRequest,
    stream: web::Payload,
    hub: web::Data<Arc<RealtimeHub>>,
) -> Result<HttpResponse, actix_web::Error> {
    let session = WsSession::new(SessionKind::Lobby, hub.get_ref().clone());
    ws::start(session, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lobby_snapshot_with_no_store_is_empty() {
        let hub = RealtimeHub::new(None, Uuid::new_v4());
        let snapshot = hub.lobby_snapshot();
        assert_eq!(snapshot["waiting"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn broadcast_to_empty_session_is_a_no_op() {
        let hub = RealtimeHub::new(None, Uuid::new_v4());
        hub.broadcast(Uuid::new_v4(), serde_json::json!({"type": "move"}), None);
    }

    #[test]
    fn lobby_snapshot_reflects_waiting_entries() {
        let dir = std::env::temp_dir().join(format!("chesscore_realtime_test_{}", Uuid::new_v4()));
        let store = Arc::new(Store::open(dir.to_str().unwrap()).unwrap());
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            connection_id: "conn-1".into(),
            user_id: None,
            display_name: "waiter".into(),
            agent_name: None,
            engine_name: None,
            is_ranked: false,
            current_elo: 1600,
            opponent_type: crate::model::OpponentType::Either,
            preferred_color: None,
            time_controls: vec![],
            joined_at_ms: now_ms(),
            expires_at_ms: now_ms() + 60_000,
            status: QueueStatus::Waiting,
            matched_session_id: None,
            is_builtin_agent: false,
        };
        store.queue_entries().unwrap().put(entry.id.as_bytes(), &entry).unwrap();
        let hub = RealtimeHub::new(Some(store), Uuid::new_v4());
        let snapshot = hub.lobby_snapshot();
        assert_eq!(snapshot["waiting"].as_array().unwrap().len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
