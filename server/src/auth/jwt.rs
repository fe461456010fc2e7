use std::path::Path;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::db::models::UserId;
use crate::error::AuthError;

/// Handshake credential check, run once per WebSocket connection.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// Access token claims issued by the account service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub userid: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 verifier sharing its secret with the account service.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(jsonwebtoken::Algorithm::HS256),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> Result<UserId, AuthError> {
        match decode::<Claims>(credential, &self.key, &self.validation) {
            Ok(data) if !data.claims.userid.is_empty() => Ok(data.claims.userid),
            Ok(_) => Err(AuthError::Invalid),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => Err(AuthError::Expired),
                _ => Err(AuthError::Invalid),
            },
        }
    }
}

/// Load or generate the JWT signing key (256-bit random secret).
/// Key is stored as raw bytes in data_dir/jwt_secret.
pub fn load_or_generate_jwt_secret(data_dir: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    std::fs::create_dir_all(data_dir)?;
    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue an access token for `user_id` valid for `ttl_secs`.
/// The account service owns issuance; this exists for tooling and tests.
pub fn issue_access_token(
    secret: &[u8],
    user_id: &str,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        userid: user_id.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}
