use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use super::claims::{Claims, TokenKind};
use crate::{config::JwtConfig, state::AppState, users::repo_types::User};

/// Signing and verification keys for one token class.
#[derive(Clone)]
struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Holds JWT signing and verification keys with config data.
#[derive(Clone)]
pub struct JwtKeys {
    access: KeyPair,
    refresh: KeyPair,
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl From<&JwtConfig> for JwtKeys {
    fn from(cfg: &JwtConfig) -> Self {
        Self {
            access: KeyPair::from_secret(&cfg.access_secret),
            refresh: KeyPair::from_secret(&cfg.refresh_secret),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            access_ttl: ttl_from_minutes(cfg.ttl_minutes),
            refresh_ttl: ttl_from_minutes(cfg.refresh_ttl_minutes),
        }
    }
}

/// Longest lifetime a token may be given: ten years.
const MAX_TTL_MINUTES: i64 = 60 * 24 * 365 * 10;

fn ttl_from_minutes(minutes: i64) -> Duration {
    Duration::from_secs(minutes.clamp(0, MAX_TTL_MINUTES) as u64 * 60)
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        JwtKeys::from(&state.config.jwt)
    }
}

impl JwtKeys {
    fn keys(&self, kind: TokenKind) -> &KeyPair {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    fn sign(&self, claims: &Claims) -> anyhow::Result<String> {
        let token = encode(&Header::default(), claims, &self.keys(claims.kind).encoding)?;
        debug!(user_id = %claims.sub, kind = ?claims.kind, "jwt signed");
        Ok(token)
    }

    fn base_claims(&self, user_id: Uuid, kind: TokenKind) -> Claims {
        let now = OffsetDateTime::now_utc();
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let exp = now + TimeDuration::seconds(ttl.as_secs() as i64);
        Claims {
            sub: user_id,
            jti: Uuid::new_v4(),
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            kind,
            username: None,
            email: None,
            full_name: None,
        }
    }

    /// Short-lived token carrying the user's identity fields.
    pub fn sign_access(&self, user: &User) -> anyhow::Result<String> {
        let mut claims = self.base_claims(user.id, TokenKind::Access);
        claims.username = Some(user.username.clone());
        claims.email = Some(user.email.clone());
        claims.full_name = Some(user.full_name.clone());
        self.sign(&claims)
    }

    /// Long-lived token carrying only the user id.
    pub fn sign_refresh(&self, user_id: Uuid) -> anyhow::Result<String> {
        self.sign(&self.base_claims(user_id, TokenKind::Refresh))
    }

    fn verify(&self, token: &str, kind: TokenKind) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.keys(kind).decoding, &validation)?;
        if data.claims.kind != kind {
            anyhow::bail!("expected a {:?} token", kind);
        }
        debug!(user_id = %data.claims.sub, kind = ?data.claims.kind, "jwt verified");
        Ok(data.claims)
    }

    pub fn verify_access(&self, token: &str) -> anyhow::Result<Claims> {
        self.verify(token, TokenKind::Access)
    }

    pub fn verify_refresh(&self, token: &str) -> anyhow::Result<Claims> {
        self.verify(token, TokenKind::Refresh)
    }
}
