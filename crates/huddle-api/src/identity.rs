use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use thiserror::Error;

use huddle_types::api::Claims;
use huddle_types::models::Identity;

#[derive(Debug, Error)]
#[error("unauthorized")]
pub struct Unauthorized;

/// Maps a bearer token to a normalized identity. Token issuance lives
/// elsewhere; this core only consumes tokens. The one implementation here
/// verifies the shared-secret JWT the auth service signs; tests swap in
/// their own resolver.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Identity, Unauthorized>;
}

pub struct JwtResolver {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityResolver for JwtResolver {
    fn resolve(&self, token: &str) -> Result<Identity, Unauthorized> {
        let data =
            decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|_| Unauthorized)?;
        Ok(Identity {
            id: data.claims.sub,
            name: data.claims.name,
            email: data.claims.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    fn token(secret: &str, name: &str) -> String {
        let claims = Claims {
            sub: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{name}@example.com"),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_resolves_to_identity() {
        let resolver = JwtResolver::new("secret");
        let identity = resolver.resolve(&token("secret", "alice")).unwrap();
        assert_eq!(identity.name, "alice");
        assert_eq!(identity.email, "alice@example.com");
    }

    #[test]
    fn wrong_secret_is_unauthorized() {
        let resolver = JwtResolver::new("secret");
        assert!(resolver.resolve(&token("other", "alice")).is_err());
        assert!(resolver.resolve("not-a-jwt").is_err());
    }
}
