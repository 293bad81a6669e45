//! PASETO v4.public access tokens.
//!
//! Access tokens are self-describing: claims carry issuer, audience, subject
//! (user id), issued-at, expiry, and a `jti` pointing at the revocation row.
//! Signing happens in-process with an Ed25519 key loaded from configuration;
//! the footer carries the PASERK id of the public key so verifiers can detect
//! key rollover.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signer, SigningKey};
use pasetors::Public;
use pasetors::errors::Error as PasetorsError;
use pasetors::footer::Footer;
use pasetors::keys::AsymmetricPublicKey;
use pasetors::paserk::{FormatAsPaserk, Id};
use pasetors::token::UntrustedToken;
use pasetors::version4::{PublicToken, V4};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const HEADER: &str = "v4.public.";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid footer")]
    InvalidFooter,
    #[error("missing footer")]
    MissingFooter,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid signing seed")]
    InvalidSeed,
    #[error("invalid key type")]
    InvalidKeyType,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("invalid issued-at")]
    InvalidIat,
    #[error("invalid expiration")]
    InvalidExp,
    #[error("token expired")]
    Expired,
    #[error("invalid token ttl")]
    InvalidTtl,
    #[error("invalid subject")]
    InvalidSubject,
    #[error("invalid length")]
    InvalidLength,
    #[error("time parse error")]
    TimeParse,
    #[error("time format error")]
    TimeFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: String,
    pub iat: String,
    pub jti: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct AccessTokenFooter {
    kid: String,
}

/// Bounds applied when verifying a presented access token.
pub struct VerificationOptions<'a> {
    pub expected_issuer: &'a str,
    pub expected_audience: &'a str,
    pub now_unix_seconds: i64,
    pub max_ttl_seconds: i64,
}

/// Signs and verifies v4.public access tokens with a single local key.
pub struct AccessTokenKey {
    issuer: String,
    audience: String,
    signing_key: SigningKey,
    public_key: AsymmetricPublicKey<V4>,
    kid: String,
}

impl std::fmt::Debug for AccessTokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenKey")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl AccessTokenKey {
    /// Build a key from a standard-base64 32-byte Ed25519 seed.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed is not valid base64, not 32 bytes, or the
    /// derived public key cannot be encoded.
    pub fn from_seed_base64(issuer: &str, audience: &str, seed_b64: &str) -> Result<Self, TokenError> {
        let raw = BASE64_STANDARD
            .decode(seed_b64.trim())
            .map_err(|_| TokenError::InvalidSeed)?;
        let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| TokenError::InvalidSeed)?;
        Self::from_seed(issuer, audience, &seed)
    }

    /// Build a key from raw Ed25519 seed bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the derived public key cannot be encoded as PASERK.
    pub fn from_seed(issuer: &str, audience: &str, seed: &[u8; 32]) -> Result<Self, TokenError> {
        let signing_key = SigningKey::from_bytes(seed);
        let public_bytes = signing_key.verifying_key().to_bytes();
        let public_key = AsymmetricPublicKey::<V4>::from(public_bytes.as_slice())
            .map_err(|_| TokenError::InvalidKeyType)?;
        let kid = format_kid(&public_key)?;

        Ok(Self {
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            signing_key,
            public_key,
            kid,
        })
    }

    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Build claims for a token minted now.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamps cannot be formatted or the ttl is
    /// not positive.
    pub fn make_claims(
        &self,
        now_unix_seconds: i64,
        ttl_seconds: i64,
        sub: &str,
        jti: &str,
    ) -> Result<AccessTokenClaims, TokenError> {
        if ttl_seconds <= 0 {
            return Err(TokenError::InvalidTtl);
        }
        let iat = rfc3339_from_unix(now_unix_seconds)?;
        let exp = rfc3339_from_unix(now_unix_seconds + ttl_seconds)?;
        Ok(AccessTokenClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: sub.to_string(),
            exp,
            iat,
            jti: jti.to_string(),
        })
    }

    /// Sign claims into a v4.public token with the key id in the footer.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding or pre-authentication encoding fails.
    pub fn sign(&self, claims: &AccessTokenClaims) -> Result<String, TokenError> {
        let footer = AccessTokenFooter {
            kid: self.kid.clone(),
        };
        let payload = serde_json::to_vec(claims)?;
        let footer_bytes = serde_json::to_vec(&footer)?;
        let pre_auth = pae(&[
            HEADER.as_bytes(),
            payload.as_slice(),
            footer_bytes.as_slice(),
            b"",
        ])?;
        let signature = self.signing_key.sign(pre_auth.as_slice());
        Ok(build_token(
            payload.as_slice(),
            footer_bytes.as_slice(),
            &signature.to_bytes(),
        ))
    }

    /// Verify a presented token and return its decoded claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed, the footer `kid` does not
    /// match this key, the signature is invalid, or the claims fail issuer /
    /// audience / time validation.
    pub fn verify(
        &self,
        token: &str,
        options: &VerificationOptions<'_>,
    ) -> Result<AccessTokenClaims, TokenError> {
        let untrusted =
            UntrustedToken::<Public, V4>::try_from(token).map_err(|err| map_paseto_error(&err))?;
        let footer_bytes = untrusted.untrusted_footer();
        if footer_bytes.is_empty() {
            return Err(TokenError::MissingFooter);
        }

        let kid = footer_kid(footer_bytes)?;
        if kid != self.kid {
            return Err(TokenError::UnknownKid(kid));
        }

        let trusted = PublicToken::verify(&self.public_key, &untrusted, None, None)
            .map_err(|err| map_paseto_error(&err))?;
        let claims: AccessTokenClaims = serde_json::from_str(trusted.payload())?;
        validate_claims(&claims, options)?;
        Ok(claims)
    }
}

/// Convert a unix timestamp to RFC3339.
///
/// # Errors
///
/// Returns an error if formatting fails.
pub fn rfc3339_from_unix(unix_seconds: i64) -> Result<String, TokenError> {
    let dt =
        OffsetDateTime::from_unix_timestamp(unix_seconds).map_err(|_| TokenError::TimeFormat)?;
    dt.format(&Rfc3339).map_err(|_| TokenError::TimeFormat)
}

/// Parse an RFC3339 timestamp into unix seconds.
///
/// # Errors
///
/// Returns an error if parsing fails.
pub fn unix_from_rfc3339(value: &str) -> Result<i64, TokenError> {
    let dt = OffsetDateTime::parse(value, &Rfc3339).map_err(|_| TokenError::TimeParse)?;
    Ok(dt.unix_timestamp())
}

fn validate_claims(
    claims: &AccessTokenClaims,
    options: &VerificationOptions<'_>,
) -> Result<(), TokenError> {
    if claims.iss != options.expected_issuer {
        return Err(TokenError::InvalidIssuer);
    }
    if claims.aud != options.expected_audience {
        return Err(TokenError::InvalidAudience);
    }
    if claims.sub.is_empty() {
        return Err(TokenError::InvalidSubject);
    }

    let iat = unix_from_rfc3339(&claims.iat).map_err(|_| TokenError::InvalidIat)?;
    let exp = unix_from_rfc3339(&claims.exp).map_err(|_| TokenError::InvalidExp)?;

    if iat > options.now_unix_seconds {
        return Err(TokenError::InvalidIat);
    }
    if exp <= options.now_unix_seconds {
        return Err(TokenError::Expired);
    }
    if exp <= iat {
        return Err(TokenError::InvalidTtl);
    }
    if exp - iat > options.max_ttl_seconds {
        return Err(TokenError::InvalidTtl);
    }

    Ok(())
}

fn build_token(payload: &[u8], footer: &[u8], signature: &[u8; 64]) -> String {
    let mut message = Vec::with_capacity(payload.len() + signature.len());
    message.extend_from_slice(payload);
    message.extend_from_slice(signature);
    let body_b64 = Base64UrlUnpadded::encode_string(&message);
    if footer.is_empty() {
        format!("{HEADER}{body_b64}")
    } else {
        let footer_b64 = Base64UrlUnpadded::encode_string(footer);
        format!("{HEADER}{body_b64}.{footer_b64}")
    }
}

fn footer_kid(footer_bytes: &[u8]) -> Result<String, TokenError> {
    let mut footer = Footer::new();
    footer
        .parse_bytes(footer_bytes)
        .map_err(|_| TokenError::InvalidFooter)?;
    let kid = footer
        .get_claim("kid")
        .and_then(|value| value.as_str())
        .ok_or(TokenError::InvalidFooter)?;
    Ok(kid.to_string())
}

fn format_kid(key: &AsymmetricPublicKey<V4>) -> Result<String, TokenError> {
    let id = Id::from(key);
    let mut kid = String::new();
    id.fmt(&mut kid).map_err(|_| TokenError::InvalidKeyType)?;
    Ok(kid)
}

fn pae(pieces: &[&[u8]]) -> Result<Vec<u8>, TokenError> {
    let count = u64::try_from(pieces.len()).map_err(|_| TokenError::InvalidLength)?;
    let mut out = Vec::new();
    out.extend_from_slice(&le64(count));
    for piece in pieces {
        let len = u64::try_from(piece.len()).map_err(|_| TokenError::InvalidLength)?;
        out.extend_from_slice(&le64(len));
        out.extend_from_slice(piece);
    }
    Ok(out)
}

fn le64(mut value: u64) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, byte) in out.iter_mut().enumerate() {
        if i == 7 {
            value &= 0x7f;
        }
        *byte = (value & 0xff) as u8;
        value >>= 8;
    }
    out
}

fn map_paseto_error(err: &PasetorsError) -> TokenError {
    match err {
        PasetorsError::Base64 => TokenError::Base64,
        PasetorsError::TokenValidation => TokenError::InvalidSignature,
        PasetorsError::FooterParsing => TokenError::InvalidFooter,
        PasetorsError::LossyConversion => TokenError::InvalidLength,
        PasetorsError::Key => TokenError::InvalidKeyType,
        _ => TokenError::TokenFormat,
    }
}
