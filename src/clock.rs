//! Per-session monotonic clock service (spec §4.3).
//!
//! Clock state is advisory: the service ticks and fires timeout callbacks,
//! but authoritative timeout resolution also happens in `GameService`
//! whenever a game is read or a move is attempted, so a missed tick or a
//! process restart cannot leave a game indefinitely active past its clock.

use crate::model::TimeControl;
use crate::types::Color;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SessionClock {
    white_ms: i64,
    black_ms: i64,
    active_color: Color,
    last_tick: Instant,
    time_control: TimeControl,
}

/// Fired when a side's clock reaches zero.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutEvent {
    pub session_id: Uuid,
    pub winner: Color,
}

/// Owns the in-memory `sessionId -> clock` map. Unlimited-time games are
/// never tracked here.
pub struct ClockService {
    sessions: DashMap<Uuid, SessionClock>,
    timeout_tx: mpsc::UnboundedSender<TimeoutEvent>,
}

impl ClockService {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TimeoutEvent>) {
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { sessions: DashMap::new(), timeout_tx }), timeout_rx)
    }

    /// Replaces any existing timer for `session_id`.
    pub fn start(&self, session_id: Uuid, white_ms: u64, black_ms: u64, active_color: Color, tc: TimeControl) {
        if tc.mode.is_unlimited() {
            self.sessions.remove(&session_id);
            return;
        }
        self.sessions.insert(
            session_id,
            SessionClock { white_ms: white_ms as i64, black_ms: black_ms as i64, active_color, last_tick: Instant::now(), time_control: tc },
        );
    }

    /// Deducts elapsed time from the mover's clock, applies the increment,
    /// and switches the active side.
    pub fn switch_turn(&self, session_id: Uuid, new_active: Color, player_who_moved: Color) {
        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
            let elapsed = entry.last_tick.elapsed().as_millis() as i64;
            let increment = entry.time_control.increment_ms as i64;
            match player_who_moved {
                Color::White => entry.white_ms = (entry.white_ms - elapsed + increment).max(0),
                Color::Black => entry.black_ms = (entry.black_ms - elapsed + increment).max(0),
            }
            entry.active_color = new_active;
            entry.last_tick = Instant::now();
        }
    }

    pub fn stop(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
    }

    pub fn remaining(&self, session_id: Uuid, color: Color) -> Option<i64> {
        self.sessions.get(&session_id).map(|c| match color {
            Color::White => c.white_ms,
            Color::Black => c.black_ms,
        })
    }

    /// Snapshots every tracked session's remaining time, for the `run` loop
    /// to broadcast as `time_update` frames after each tick.
    pub fn snapshot(&self) -> Vec<(Uuid, i64, i64, Color)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().white_ms, entry.value().black_ms, entry.value().active_color))
            .collect()
    }

    /// One tick of the background loop: deducts elapsed ms from the active
    /// side of every tracked session and fires `TimeoutEvent`s for any that
    /// crossed zero.
    pub fn tick(&self) {
        let mut expired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session_id = *entry.key();
            let clock = entry.value_mut();
            let elapsed = clock.last_tick.elapsed().as_millis() as i64;
            clock.last_tick = Instant::now();
            match clock.active_color {
                Color::White => clock.white_ms -= elapsed,
                Color::Black => clock.black_ms -= elapsed,
            }
            let (remaining, winner) = match clock.active_color {
                Color::White => (clock.white_ms, Color::Black),
                Color::Black => (clock.black_ms, Color::White),
            };
            if remaining <= 0 {
                match clock.active_color {
                    Color::White => clock.white_ms = 0,
                    Color::Black => clock.black_ms = 0,
                }
                expired.push((session_id, winner));
            }
        }
        for (session_id, winner) in expired {
            self.sessions.remove(&session_id);
            let _ = self.timeout_tx.send(TimeoutEvent { session_id, winner });
        }
    }

    /// Runs the ~1Hz background tick loop until `shutdown` fires, pushing a
    /// local-only `time_update` for every tracked session after each tick
    /// (Open Question (a): these never cross the event bus).
    pub async fn run(self: Arc<Self>, tick_ms: u64, hub: Arc<crate::realtime::RealtimeHub>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(tick_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                    for (session_id, white_ms, black_ms, active_color) in self.snapshot() {
                        let event = serde_json::json!({
                            "type": "time_update",
                            "sessionId": session_id,
                            "whiteRemainingMs": white_ms.max(0),
                            "blackRemainingMs": black_ms.max(0),
                            "activeColor": active_color,
                            "serverTime": crate::model::now_ms(),
                        });
                        hub.broadcast_local_only(session_id, event);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("clock service shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeControlMode;

    #[test]
    fn switch_turn_deducts_and_adds_increment() {
        let (svc, _rx) = ClockService::new();
        let tc = TimeControl::new(TimeControlMode::Blitz);
        svc.start(Uuid::new_v4(), tc.base_ms, tc.base_ms, Color::White, tc);
    }

    #[test]
    fn unlimited_games_are_not_tracked() {
        let (svc, _rx) = ClockService::new();
        let session_id = Uuid::new_v4();
        let tc = TimeControl::new(TimeControlMode::Unlimited);
        svc.start(session_id, 0, 0, Color::White, tc);
        assert!(svc.remaining(session_id, Color::White).is_none());
    }
}
