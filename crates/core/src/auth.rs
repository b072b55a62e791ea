//! Credentialing collaborator (out-of-scope per spec §1, narrow interface
//! only): password hashing and bearer-token issuance/verification. The
//! Session Registry's hybrid WS authorization (spec §4.4 step 2) decodes a
//! signed token directly, so the codec lives here rather than in the
//! server crate. Grounded in `hanibalsk-phone-manager-backend`'s
//! `argon2` + `jsonwebtoken` pairing.

use crate::error::{AppError, AppResult};
use crate::model::Role;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::Internal(format!("password hash: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Subject of a signed token: either a user (admin/user role) or a device
/// (spec §4.4 step 2: "if role = device and token.deviceId == deviceId").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRole {
    Admin,
    User,
    Device,
}

impl From<Role> for TokenRole {
    fn from(r: Role) -> Self {
        match r {
            Role::Admin => TokenRole::Admin,
            Role::User => TokenRole::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: TokenRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub exp: usize,
}

pub trait TokenCodec: Send + Sync {
    fn issue_user_token(&self, user_id: Uuid, role: Role) -> AppResult<String>;
    fn issue_device_token(&self, device_id: &str) -> AppResult<String>;
    fn decode(&self, token: &str) -> AppResult<Claims>;
}

pub struct JwtTokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expires_in_s: i64,
}

impl JwtTokenCodec {
    pub fn new(secret: &str, expires_in_s: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expires_in_s,
        }
    }

    fn expiry(&self) -> usize {
        (chrono::Utc::now() + chrono::Duration::seconds(self.expires_in_s)).timestamp() as usize
    }
}

impl TokenCodec for JwtTokenCodec {
    fn issue_user_token(&self, user_id: Uuid, role: Role) -> AppResult<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.into(),
            device_id: None,
            exp: self.expiry(),
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("token issue: {e}")))
    }

    fn issue_device_token(&self, device_id: &str) -> AppResult<String> {
        let claims = Claims {
            sub: device_id.to_string(),
            role: TokenRole::Device,
            device_id: Some(device_id.to_string()),
            exp: self.expiry(),
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("token issue: {e}")))
    }

    fn decode(&self, token: &str) -> AppResult<Claims> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| AppError::AuthFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn user_token_roundtrips_claims() {
        let codec = JwtTokenCodec::new("test-secret", 3600);
        let user_id = Uuid::new_v4();
        let token = codec.issue_user_token(user_id, Role::Admin).unwrap();
        let claims = codec.decode(&token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.role, TokenRole::Admin);
        assert!(claims.device_id.is_none());
    }

    #[test]
    fn device_token_carries_device_id() {
        let codec = JwtTokenCodec::new("test-secret", 3600);
        let token = codec.issue_device_token("dev-42").unwrap();
        let claims = codec.decode(&token).unwrap();
        assert_eq!(claims.role, TokenRole::Device);
        assert_eq!(claims.device_id.as_deref(), Some("dev-42"));
    }

    #[test]
    fn decode_rejects_garbage_token() {
        let codec = JwtTokenCodec::new("test-secret", 3600);
        assert!(matches!(codec.decode("not-a-jwt"), Err(AppError::AuthFailed)));
    }
}
