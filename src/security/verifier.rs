//! Order authentication and host scoping

use crate::config::AgentConfig;
use appliance_shared::{Order, OrderError};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Authenticates signed orders against the control service's key
pub struct OrderVerifier {
    public_key: RwLock<Option<VerifyingKey>>,
    appliance_id: RwLock<Option<String>>,
}

impl OrderVerifier {
    /// Create a verifier with no key and no identity configured
    pub fn new() -> Self {
        Self {
            public_key: RwLock::new(None),
            appliance_id: RwLock::new(None),
        }
    }

    /// Create a verifier from the configured key and identity
    pub fn from_config(config: &AgentConfig) -> Result<Self, OrderError> {
        let public_key = config
            .server_public_key
            .as_deref()
            .map(parse_public_key)
            .transpose()?;
        if public_key.is_some() {
            info!("Server public key configured, signed orders required");
        }

        Ok(Self {
            public_key: RwLock::new(public_key),
            appliance_id: RwLock::new(config.appliance_id.clone()),
        })
    }

    /// Configure the key used for all subsequent verifications
    pub async fn set_public_key(&self, key_hex: &str) -> Result<(), OrderError> {
        let key = parse_public_key(key_hex)?;
        *self.public_key.write().await = Some(key);
        info!("Server public key configured, signed orders now required");
        Ok(())
    }

    /// Configure this appliance's identity for host scoping
    pub async fn set_appliance_id(&self, appliance_id: impl Into<String>) {
        let appliance_id = appliance_id.into();
        info!("Appliance identity set to {}", appliance_id);
        *self.appliance_id.write().await = Some(appliance_id);
    }

    pub async fn has_public_key(&self) -> bool {
        self.public_key.read().await.is_some()
    }

    /// Authenticate an order and enforce its host scope
    pub async fn verify(&self, order: &Order) -> Result<(), OrderError> {
        let signature_hex = order.signature.as_deref().filter(|s| !s.is_empty());
        let payload = order.signed_payload.as_deref().filter(|s| !s.is_empty());

        let Some(key) = *self.public_key.read().await else {
            if signature_hex.is_some() {
                warn!(
                    order_id = %order.order_id,
                    "Order carries a signature but no server key is configured, accepting unverified"
                );
            }
            return Ok(());
        };

        let (Some(signature_hex), Some(payload)) = (signature_hex, payload) else {
            return Err(OrderError::UnsignedOrderRejected);
        };

        let signature_bytes = hex::decode(signature_hex)
            .map_err(|_| OrderError::SignatureInvalid("signature is not hex".into()))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| OrderError::SignatureInvalid("signature must be 64 bytes".into()))?;
        key.verify(payload.as_bytes(), &signature)
            .map_err(|_| OrderError::SignatureInvalid("signature does not match payload".into()))?;

        let claims: Value = serde_json::from_str(payload)
            .map_err(|_| OrderError::SignatureInvalid("signed payload is not JSON".into()))?;
        let Value::Object(claims) = claims else {
            return Err(OrderError::SignatureInvalid(
                "signed payload is not a JSON object".into(),
            ));
        };

        for (field, expected) in [("order_id", &order.order_id), ("order_type", &order.order_type)] {
            if let Some(claimed) = claims.get(field) {
                if claimed.as_str() != Some(expected.as_str()) {
                    return Err(OrderError::SignatureInvalid(format!(
                        "signed {field} does not match order"
                    )));
                }
            }
        }

        match claims.get("expires_at") {
            None | Some(Value::Null) => {}
            Some(Value::String(expires_at)) => {
                let deadline = DateTime::parse_from_rfc3339(expires_at).map_err(|_| {
                    OrderError::SignatureInvalid("expires_at is not an RFC 3339 timestamp".into())
                })?;
                if Utc::now() > deadline {
                    return Err(OrderError::OrderExpired(expires_at.clone()));
                }
            }
            Some(_) => {
                return Err(OrderError::SignatureInvalid(
                    "expires_at is not an RFC 3339 timestamp".into(),
                ))
            }
        }

        self.check_host_scope(claims.get("target_appliance_id")).await
    }

    async fn check_host_scope(&self, target: Option<&Value>) -> Result<(), OrderError> {
        let target = match target {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::String(s)) if s.is_empty() => return Ok(()),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        match self.appliance_id.read().await.as_deref() {
            None => {
                debug!("Host scope {} not enforced, appliance identity unknown", target);
                Ok(())
            }
            Some(local) if local == target => Ok(()),
            Some(local) => Err(OrderError::HostScopeMismatch {
                target,
                local: local.to_string(),
            }),
        }
    }
}

fn parse_public_key(key_hex: &str) -> Result<VerifyingKey, OrderError> {
    let bytes = hex::decode(key_hex.trim())
        .map_err(|e| OrderError::InvalidKey(format!("not hex: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| OrderError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| OrderError::InvalidKey(e.to_string()))
}

impl Default for OrderVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use appliance_shared::Order;
    use ed25519_dalek::{Signer, SigningKey};

    /// Deterministic control-service key for fixtures
    pub fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    pub fn public_key_hex() -> String {
        hex::encode(signing_key().verifying_key().to_bytes())
    }

    /// Sign `payload` and attach it to `order`
    pub fn sign(order: Order, payload: &serde_json::Value) -> Order {
        let payload = payload.to_string();
        let signature = signing_key().sign(payload.as_bytes());
        order.with_signature(payload, hex::encode(signature.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{public_key_hex, sign};
    use super::*;
    use appliance_shared::Params;
    use serde_json::json;

    fn order() -> Order {
        Order::new("ord-1", "force_checkin", Params::new())
    }

    async fn keyed_verifier() -> OrderVerifier {
        let verifier = OrderVerifier::new();
        verifier.set_public_key(&public_key_hex()).await.unwrap();
        verifier
    }

    #[tokio::test]
    async fn test_no_key_allows_everything() {
        let verifier = OrderVerifier::new();
        assert!(verifier.verify(&order()).await.is_ok());

        let signed = order().with_signature("{}", "not-even-hex");
        assert!(verifier.verify(&signed).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let verifier = OrderVerifier::new();
        assert!(matches!(
            verifier.set_public_key("zz").await,
            Err(OrderError::InvalidKey(_))
        ));
        assert!(matches!(
            verifier.set_public_key("abcd").await,
            Err(OrderError::InvalidKey(_))
        ));
        assert!(!verifier.has_public_key().await);
    }

    #[tokio::test]
    async fn test_unsigned_rejected_once_keyed() {
        let verifier = keyed_verifier().await;
        assert_eq!(
            verifier.verify(&order()).await,
            Err(OrderError::UnsignedOrderRejected)
        );

        let mut half = order();
        half.signature = Some("00".repeat(64));
        assert_eq!(verifier.verify(&half).await, Err(OrderError::UnsignedOrderRejected));
    }

    #[tokio::test]
    async fn test_valid_signature_accepted() {
        let verifier = keyed_verifier().await;
        let signed = sign(order(), &json!({"order_id": "ord-1", "order_type": "force_checkin"}));
        assert!(verifier.verify(&signed).await.is_ok());
    }

    #[tokio::test]
    async fn test_tampered_payload_rejected() {
        let verifier = keyed_verifier().await;
        let mut signed = sign(order(), &json!({"order_id": "ord-1"}));
        signed.signed_payload = Some(r#"{"order_id":"ord-2"}"#.into());
        assert!(matches!(
            verifier.verify(&signed).await,
            Err(OrderError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_payload_bound_to_order_fields() {
        let verifier = keyed_verifier().await;
        let signed = sign(order(), &json!({"order_id": "ord-1", "order_type": "nixos_rebuild"}));
        assert!(matches!(
            verifier.verify(&signed).await,
            Err(OrderError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_host_scope() {
        let verifier = keyed_verifier().await;
        verifier.set_appliance_id("appliance-a").await;

        let ours = sign(order(), &json!({"target_appliance_id": "appliance-a"}));
        assert!(verifier.verify(&ours).await.is_ok());

        let fleet = sign(order(), &json!({"target_appliance_id": null}));
        assert!(verifier.verify(&fleet).await.is_ok());

        let untargeted = sign(order(), &json!({"order_id": "ord-1"}));
        assert!(verifier.verify(&untargeted).await.is_ok());

        let theirs = sign(order(), &json!({"target_appliance_id": "appliance-b"}));
        assert_eq!(
            verifier.verify(&theirs).await,
            Err(OrderError::HostScopeMismatch {
                target: "appliance-b".into(),
                local: "appliance-a".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_host_scope_skipped_before_identity_known() {
        let verifier = keyed_verifier().await;
        let theirs = sign(order(), &json!({"target_appliance_id": "appliance-b"}));
        assert!(verifier.verify(&theirs).await.is_ok());
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut config = AgentConfig::default();
        assert!(!OrderVerifier::from_config(&config).unwrap().has_public_key().await);

        config.server_public_key = Some(public_key_hex());
        config.appliance_id = Some("appliance-a".into());
        let verifier = OrderVerifier::from_config(&config).unwrap();
        assert!(verifier.has_public_key().await);
        let theirs = sign(order(), &json!({"target_appliance_id": "appliance-b"}));
        assert!(matches!(
            verifier.verify(&theirs).await,
            Err(OrderError::HostScopeMismatch { .. })
        ));

        config.server_public_key = Some("nope".into());
        assert!(OrderVerifier::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_expired_order_rejected() {
        let verifier = keyed_verifier().await;
        let stale = sign(order(), &json!({"expires_at": "2001-01-01T00:00:00Z"}));
        assert!(matches!(
            verifier.verify(&stale).await,
            Err(OrderError::OrderExpired(_))
        ));

        let fresh = sign(order(), &json!({"expires_at": "2999-01-01T00:00:00Z"}));
        assert!(verifier.verify(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_non_string_expiry_rejected() {
        let verifier = keyed_verifier().await;
        for expires_at in [json!(978307200), json!(true), json!({"at": "2999-01-01T00:00:00Z"})] {
            let signed = sign(order(), &json!({"expires_at": expires_at}));
            assert!(matches!(
                verifier.verify(&signed).await,
                Err(OrderError::SignatureInvalid(_))
            ));
        }
    }
}
