//! User and agent-rating persistence, plus the auth boundary (spec §4.11,
//! ambient). DTOs follow the plain-struct-plus-utoipa-schema style used
//! throughout `api.rs`.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CoreError, ErrorCode};
use crate::model::{AgentRating, AuthContext, User};
use crate::store::Store;

const MAX_FAILED_LOGIN_ATTEMPTS: u32 = 5;
const LOCKOUT_DURATION_MS: u64 = 15 * 60 * 1000;

pub struct UserService {
    store: Arc<Store>,
}

impl UserService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn register(&self, email: &str, display_name: &str) -> Result<User, CoreError> {
        if !User::is_valid_display_name(display_name) {
            return Err(CoreError::validation("display name must be 3-20 alphanumeric/underscore characters"));
        }
        let email = email.to_lowercase();
        let existing = self.store.users()?.scan_prefix::<User>(b"")?;
        if existing.iter().any(|u| u.email == email) {
            return Err(CoreError::conflict("email already registered"));
        }
        let user = User::new(Uuid::new_v4(), email, display_name.to_string());
        self.store.users()?.put(user.id.as_bytes(), &user)?;
        Ok(user)
    }

    pub fn get(&self, user_id: Uuid) -> Result<User, CoreError> {
        self.store
            .users()?
            .get::<User>(user_id.as_bytes())?
            .ok_or_else(|| CoreError::not_found(format!("no such user: {user_id}")))
    }

    pub fn lookup_by_display_name(&self, display_name: &str) -> Result<User, CoreError> {
        self.store
            .users()?
            .scan_prefix::<User>(b"")?
            .into_iter()
            .find(|u| u.display_name.eq_ignore_ascii_case(display_name))
            .ok_or_else(|| CoreError::not_found(format!("no such user: {display_name}")))
    }

    /// Records a failed login, locking the account once the attempt count
    /// crosses the threshold.
    pub fn record_failed_login(&self, user_id: Uuid, now_ms: u64) -> Result<(), CoreError> {
        self.store.users()?.compare_and_swap::<User, _>(user_id.as_bytes(), |existing| {
            let mut user = existing.ok_or_else(|| CoreError::not_found(format!("no such user: {user_id}")))?;
            user.failed_login_attempts += 1;
            if user.failed_login_attempts >= MAX_FAILED_LOGIN_ATTEMPTS {
                user.account_locked_until_ms = Some(now_ms + LOCKOUT_DURATION_MS);
            }
            Ok(user)
        })?;
        Ok(())
    }

    pub fn clear_failed_logins(&self, user_id: Uuid) -> Result<(), CoreError> {
        self.store.users()?.compare_and_swap::<User, _>(user_id.as_bytes(), |existing| {
            let mut user = existing.ok_or_else(|| CoreError::not_found(format!("no such user: {user_id}")))?;
            user.failed_login_attempts = 0;
            user.account_locked_until_ms = None;
            Ok(user)
        })?;
        Ok(())
    }

    pub fn leaderboard(&self, limit: usize) -> Result<Vec<User>, CoreError> {
        let mut users = self.store.users()?.scan_prefix::<User>(b"")?;
        users.sort_by(|a, b| b.elo_rating.cmp(&a.elo_rating));
        users.truncate(limit);
        Ok(users)
    }

    pub fn agent_leaderboard(&self, limit: usize) -> Result<Vec<AgentRating>, CoreError> {
        let mut ratings = self.store.agent_ratings()?.scan_prefix::<AgentRating>(b"")?;
        ratings.sort_by(|a, b| b.elo_rating.cmp(&a.elo_rating));
        ratings.truncate(limit);
        Ok(ratings)
    }
}

/// Resolves a bearer token into an [`AuthContext`]. A real deployment would
/// verify a signed session token against an identity provider; this
/// recognizes the two identities the rest of the server actually issues —
/// the built-in agent's self-issued `agent:<uuid>` token (see `agent.rs`)
/// and a raw user id used as its own bearer token — and otherwise returns
/// an anonymous context rather than erroring, since most routes accept
/// anonymous/unauthenticated players.
pub fn resolve_token(token: &str) -> AuthContext {
    if let Some(rest) = token.strip_prefix("agent:") {
        if let Ok(user_id) = Uuid::parse_str(rest) {
            return AuthContext { user_id: Some(user_id), is_api_key: true };
        }
    }
    if let Ok(user_id) = Uuid::parse_str(token) {
        return AuthContext { user_id: Some(user_id), is_api_key: false };
    }
    AuthContext::anonymous()
}

/// Used by `create_game`/`join_game` to reject an unverified email before a
/// registered user takes a player slot (spec §4.11).
pub fn require_verified_email(user: &User) -> Result<(), crate::error::CodedCoreError> {
    if user.email_verified {
        Ok(())
    } else {
        Err(CoreError::validation("email address is not verified").with_code(ErrorCode::EmailNotVerified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_service() -> UserService {
        let dir = std::env::temp_dir().join(format!("chesscore_users_test_{}", Uuid::new_v4()));
        UserService::new(Arc::new(Store::open(dir.to_str().unwrap()).unwrap()))
    }

    #[test]
    fn register_rejects_invalid_display_name() {
        let svc = temp_service();
        let err = svc.register("a@b.com", "x").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn register_rejects_duplicate_email() {
        let svc = temp_service();
        svc.register("a@b.com", "alice_one").unwrap();
        let err = svc.register("A@B.COM", "alice_two").unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn failed_logins_lock_account_after_threshold() {
        let svc = temp_service();
        let user = svc.register("a@b.com", "alice_one").unwrap();
        for _ in 0..MAX_FAILED_LOGIN_ATTEMPTS {
            svc.record_failed_login(user.id, 1_000).unwrap();
        }
        let reloaded = svc.get(user.id).unwrap();
        assert!(reloaded.is_locked(1_000));
    }

    #[test]
    fn resolve_token_recognizes_agent_prefix() {
        let id = Uuid::new_v4();
        let auth = resolve_token(&format!("agent:{id}"));
        assert_eq!(auth.user_id, Some(id));
        assert!(auth.is_api_key);
    }

    #[test]
    fn resolve_token_falls_back_to_anonymous() {
        let auth = resolve_token("not-a-token");
        assert_eq!(auth.user_id, None);
    }
}
