//! Peer-scoped credentials.
//!
//! Tokens are HS256 JWTs carrying `{"device_id", "type": "device", "iat"}` so that agents
//! provisioned against earlier deployments keep authenticating.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{HubError, HubResult};
use crate::types::PeerId;

type HmacSha256 = Hmac<Sha256>;

pub const DEVICE_TOKEN_TYPE: &str = "device";
const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

pub trait CredentialVerifier: Send + Sync {
    /// Returns the peer the credential was issued to.
    fn verify(&self, token: &str) -> HubResult<PeerId>;
}

pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, peer_id: &PeerId) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
struct DeviceClaims {
    device_id: String,
    #[serde(rename = "type")]
    token_type: String,
    #[serde(default)]
    iat: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct JwtHeader {
    alg: String,
}

#[derive(Debug, thiserror::Error)]
#[error("credential secret must not be empty")]
pub struct InvalidSecret;

/// Issues and verifies device tokens with a shared HMAC key.
#[derive(Clone)]
pub struct HmacCredentials {
    keyed: HmacSha256,
}

impl HmacCredentials {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, InvalidSecret> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(InvalidSecret);
        }
        let keyed = HmacSha256::new_from_slice(secret).map_err(|_| InvalidSecret)?;
        Ok(Self { keyed })
    }

    fn mac(&self) -> HmacSha256 {
        self.keyed.clone()
    }

    fn sign(&self, signing_input: &str) -> String {
        let mut mac = self.mac();
        mac.update(signing_input.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

impl CredentialIssuer for HmacCredentials {
    fn issue(&self, peer_id: &PeerId) -> String {
        let claims = serde_json::json!({
            "device_id": peer_id.as_str(),
            "type": DEVICE_TOKEN_TYPE,
            "iat": Utc::now().timestamp(),
        });
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let signature = self.sign(&signing_input);
        format!("{signing_input}.{signature}")
    }
}

impl CredentialVerifier for HmacCredentials {
    fn verify(&self, token: &str) -> HubResult<PeerId> {
        let mut parts = token.trim().split('.');
        let (Some(header), Some(claims), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HubError::AuthFailed("malformed token".into()));
        };

        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| HubError::AuthFailed("malformed signature".into()))?;
        let mut mac = self.mac();
        mac.update(format!("{header}.{claims}").as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| HubError::AuthFailed("invalid signature".into()))?;

        let header: JwtHeader = decode_segment(header)?;
        if header.alg != "HS256" {
            return Err(HubError::AuthFailed(format!(
                "unsupported algorithm {}",
                header.alg
            )));
        }

        let claims: DeviceClaims = decode_segment(claims)?;
        if claims.token_type != DEVICE_TOKEN_TYPE {
            return Err(HubError::AuthFailed(format!(
                "token type '{}' is not a device credential",
                claims.token_type
            )));
        }
        if claims.device_id.is_empty() {
            return Err(HubError::AuthFailed("token names no device".into()));
        }

        Ok(PeerId::from(claims.device_id))
    }
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> HubResult<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| HubError::AuthFailed("malformed token segment".into()))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| HubError::AuthFailed(format!("invalid token payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(secret: &str) -> HmacCredentials {
        HmacCredentials::new(secret).unwrap()
    }

    fn forge(secret: &str, claims: serde_json::Value) -> String {
        let creds = creds(secret);
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let signature = creds.sign(&signing_input);
        format!("{signing_input}.{signature}")
    }

    #[test]
    fn issued_token_verifies_to_same_peer() {
        let creds = creds("secret");
        let peer = PeerId::from("phone-1");
        let token = creds.issue(&peer);
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(creds.verify(&token).unwrap(), peer);
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let token = creds("other").issue(&PeerId::from("phone-1"));
        let err = creds("secret").verify(&token).unwrap_err();
        assert!(matches!(err, HubError::AuthFailed(_)));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let creds = creds("secret");
        let token = creds.issue(&PeerId::from("phone-1"));
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_claims =
            URL_SAFE_NO_PAD.encode(r#"{"device_id":"phone-2","type":"device"}"#);
        parts[1] = &forged_claims;
        assert!(creds.verify(&parts.join(".")).is_err());
    }

    #[test]
    fn non_device_token_type_is_rejected() {
        let token = forge(
            "secret",
            serde_json::json!({"device_id": "phone-1", "type": "admin"}),
        );
        let err = creds("secret").verify(&token).unwrap_err();
        assert!(err.to_string().contains("not a device credential"));
    }

    #[test]
    fn empty_secret_is_refused() {
        assert!(HmacCredentials::new("").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let creds = creds("secret");
        for token in ["", "abc", "a.b", "a.b.c.d", "!!.??.**"] {
            assert!(creds.verify(token).is_err(), "{token} should not verify");
        }
    }
}
