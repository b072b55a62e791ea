//! Bearer-token extraction shared by the HTTP handlers. Grounded in the
//! same decode-the-JWT step `ws.rs::authorize` already performs for the
//! socket handshake (spec §4.4 step 2); HTTP handlers need the plain,
//! no-device-binding half of that logic.

use crate::state::SharedState;
use axum::http::HeaderMap;
use gpsfleet_core::auth::{TokenCodec, TokenRole};
use gpsfleet_core::{AppError, AppResult};
use uuid::Uuid;

pub struct AuthCtx {
    pub user_id: Uuid,
    pub role: TokenRole,
}

impl AuthCtx {
    pub fn is_admin(&self) -> bool {
        self.role == TokenRole::Admin
    }

    pub fn require_admin(&self) -> AppResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    /// Forbidden unless the caller is an admin or owns `resource_owner`.
    pub fn require_owner_or_admin(&self, resource_owner: Uuid) -> AppResult<()> {
        if self.is_admin() || self.user_id == resource_owner {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Decode the caller's bearer token into a user/admin auth context.
/// Device-scoped tokens (issued by `/api/devices/activate`) are only valid
/// on the socket, so they are rejected here with `AuthFailed`.
pub fn authenticate(state: &SharedState, headers: &HeaderMap) -> AppResult<AuthCtx> {
    let token = bearer_token(headers).ok_or(AppError::AuthRequired)?;
    let claims = state.tokens.decode(token)?;
    let role = claims.role;
    if role == TokenRole::Device {
        return Err(AppError::AuthFailed);
    }
    let user_id = claims.sub.parse::<Uuid>().map_err(|_| AppError::AuthFailed)?;
    Ok(AuthCtx { user_id, role })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_may_act_on_any_owner() {
        let ctx = AuthCtx {
            user_id: Uuid::new_v4(),
            role: TokenRole::Admin,
        };
        assert!(ctx.require_owner_or_admin(Uuid::new_v4()).is_ok());
    }

    #[test]
    fn owner_may_act_on_their_own_resource() {
        let user_id = Uuid::new_v4();
        let ctx = AuthCtx {
            user_id,
            role: TokenRole::User,
        };
        assert!(ctx.require_owner_or_admin(user_id).is_ok());
    }

    #[test]
    fn non_owner_non_admin_is_forbidden() {
        let ctx = AuthCtx {
            user_id: Uuid::new_v4(),
            role: TokenRole::User,
        };
        assert!(matches!(
            ctx.require_owner_or_admin(Uuid::new_v4()),
            Err(AppError::Forbidden)
        ));
    }
}
