//! Authentication middleware
//!
//! Verifies HS256 bearer tokens and exposes the caller as [`AuthUser`].
//! Token issuance lives elsewhere on the platform.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use shared::{Actor, UserRole};
use uuid::Uuid;

use crate::error::AppError;
use crate::AppState;

/// Authenticated user information extracted from JWT
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
}

impl AuthUser {
    /// The audit identity recorded on status changes and harvests
    pub fn actor(&self) -> Actor {
        Actor::new(self.user_id, self.email.clone())
    }

    /// Reject read-only roles
    pub fn require_write(&self) -> Result<(), AppError> {
        if self.role.can_write() {
            Ok(())
        } else {
            Err(AppError::InsufficientPermissions)
        }
    }
}

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub role: UserRole,
    pub exp: i64,
    pub iat: i64,
}

/// Authentication middleware that validates JWT tokens
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        Some(token) => token,
        None => {
            return AppError::Unauthorized("Missing or invalid Authorization header".into())
                .into_response()
        }
    };

    let auth_user = match decode_jwt(token, &state.config.jwt.secret) {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    request.extensions_mut().insert(auth_user);

    next.run(request).await
}

/// Decode and validate JWT token
pub fn decode_jwt(token: &str, secret: &str) -> Result<AuthUser, AppError> {
    use jsonwebtoken::{decode, DecodingKey, Validation};

    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;

    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AppError::Unauthorized("Invalid user ID in token".into()))?;

    Ok(AuthUser {
        user_id,
        email: claims.email,
        role: claims.role,
    })
}

/// Extractor for authenticated user
/// Use this in handlers to get the current user
#[derive(Clone, Debug)]
pub struct CurrentUser(pub AuthUser);

#[axum::async_trait]
impl<S> axum::extract::FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| AppError::Unauthorized("Authentication required".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, role: UserRole, exp_offset: i64) -> (Uuid, String) {
        let user_id = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            email: "grower@example.com".to_string(),
            role,
            exp: now + exp_offset,
            iat: now,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap();
        (user_id, token)
    }

    #[test]
    fn test_decode_valid_token() {
        let (user_id, token) = token("secret", UserRole::Manager, 3600);
        let user = decode_jwt(&token, "secret").unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.role, UserRole::Manager);
        assert_eq!(user.actor().email, "grower@example.com");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (_, token) = token("secret", UserRole::User, 3600);
        assert!(matches!(decode_jwt(&token, "other"), Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        let (_, token) = token("secret", UserRole::User, -3600);
        assert!(decode_jwt(&token, "secret").is_err());
    }

    #[test]
    fn test_viewer_cannot_write() {
        let viewer = AuthUser {
            user_id: Uuid::new_v4(),
            email: "v@example.com".into(),
            role: UserRole::Viewer,
        };
        assert!(viewer.require_write().is_err());
    }

    #[test]
    fn test_token_without_role_is_read_only() {
        let now = chrono::Utc::now().timestamp();
        let claims = serde_json::json!({
            "sub": Uuid::new_v4().to_string(),
            "email": "legacy@example.com",
            "exp": now + 3600,
            "iat": now,
        });
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"secret")).unwrap();

        let user = decode_jwt(&token, "secret").unwrap();
        assert_eq!(user.role, UserRole::Viewer);
        assert!(user.require_write().is_err());
    }
}
