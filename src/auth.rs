// auth.rs - Challenge-based wallet authentication
//
// auth_request issues a UUID challenge bound to the connection. auth_verify
// either proves the challenge (EIP-712 Policy grant or personal-sign over
// the raw challenge string) and mints the session key plus a bearer token,
// or re-attaches an existing session from a JWT.
//
// Challenges have a short TTL and are superseded by a newer auth_request on
// the same connection; a successful verify consumes the challenge.

use std::collections::HashMap;

use alloy::primitives::Address;
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{self, SigVerifier};
use crate::error::RpcError;
use crate::model::{
    address_key, now_ms, Allowance, AuthChallengeResponse, AuthRequestParams, AuthVerifyResponse,
    SessionKey,
};
use crate::session_keys::SessionKeyRegistry;

/// A challenge waiting for auth_verify on one connection.
#[derive(Debug, Clone)]
struct PendingChallenge {
    token: String,
    address: Address,
    session_key: Address,
    application: Address,
    allowances: Vec<Allowance>,
    expires_at: u64,
    scope: String,
    issued_at: u64,
}

/// Claims embedded in the bearer token.
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Wallet address.
    pub sub: String,
    /// Session key address.
    pub key: String,
    pub scope: String,
    /// Expiry in seconds since epoch.
    pub exp: u64,
}

pub struct AuthManager {
    challenges: DashMap<u64, PendingChallenge>,
    jwt_secret: String,
    challenge_ttl_ms: u64,
    chain_id: u64,
    custody: Address,
}

impl AuthManager {
    pub fn new(jwt_secret: String, challenge_ttl_secs: u64, chain_id: u64, custody: Address) -> Self {
        Self {
            challenges: DashMap::new(),
            jwt_secret,
            challenge_ttl_ms: challenge_ttl_secs * 1000,
            chain_id,
            custody,
        }
    }

    /// Issue a challenge for the connection, superseding any prior one.
    pub fn auth_request(&self, connection_id: u64, params: AuthRequestParams) -> AuthChallengeResponse {
        let token = Uuid::new_v4().to_string();
        self.challenges.insert(
            connection_id,
            PendingChallenge {
                token: token.clone(),
                address: params.address,
                session_key: params.session_key,
                application: params.application,
                allowances: params.allowances,
                expires_at: params.expires_at,
                scope: params.scope,
                issued_at: now_ms(),
            },
        );
        AuthChallengeResponse { challenge_message: token }
    }

    /// Challenge branch of auth_verify. Returns the authenticated wallet and
    /// session key on success; the challenge is consumed.
    pub async fn verify_challenge(
        &self,
        connection_id: u64,
        challenge: &str,
        signatures: &[String],
        verifier: &SigVerifier,
        registry: &SessionKeyRegistry,
    ) -> Result<(Address, Address, AuthVerifyResponse), RpcError> {
        let pending = self
            .challenges
            .get(&connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RpcError::Unauthorized("no pending challenge".to_string()))?;

        if now_ms() > pending.issued_at + self.challenge_ttl_ms {
            self.challenges.remove(&connection_id);
            return Err(RpcError::Unauthorized("challenge expired".to_string()));
        }
        if pending.token != challenge {
            return Err(RpcError::Unauthorized("unknown challenge".to_string()));
        }

        let digest = crypto::policy_digest(
            &pending.token,
            &pending.scope,
            pending.address,
            pending.application,
            pending.session_key,
            pending.expires_at,
            &pending.allowances,
            self.chain_id,
            self.custody,
        );

        let mut verified = false;
        for signature in signatures {
            if verifier.verify_digest(digest, signature, pending.address).await? {
                verified = true;
                break;
            }
            // Personal-sign fallback over the raw challenge string.
            if verifier
                .verify_payload(pending.token.as_bytes(), signature, pending.address)
                .await?
            {
                verified = true;
                break;
            }
        }
        if !verified {
            return Err(RpcError::InvalidSignature(
                "challenge signature does not match expected address".to_string(),
            ));
        }

        registry
            .register(SessionKey {
                address: pending.session_key,
                wallet: pending.address,
                application: pending.application,
                scope: pending.scope.clone(),
                allowances: pending.allowances.clone(),
                used: HashMap::new(),
                expires_at: pending.expires_at,
                created_at: now_ms(),
                revoked: false,
            })
            .await?;

        self.challenges.remove(&connection_id);

        let jwt_token = self.issue_jwt(pending.address, pending.session_key, &pending.scope, pending.expires_at)?;
        Ok((
            pending.address,
            pending.session_key,
            AuthVerifyResponse {
                address: address_key(pending.address),
                session_key: address_key(pending.session_key),
                jwt_token,
            },
        ))
    }

    /// JWT branch of auth_verify: validate the token and re-attach the
    /// persisted session key state.
    pub async fn verify_jwt(
        &self,
        token: &str,
        registry: &SessionKeyRegistry,
    ) -> Result<(Address, Address, AuthVerifyResponse), RpcError> {
        let decoded = decode::<JwtClaims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| RpcError::Unauthorized(format!("invalid jwt: {}", e)))?;

        let wallet = crypto::parse_address(&decoded.claims.sub)
            .map_err(|_| RpcError::Unauthorized("invalid jwt subject".to_string()))?;
        let session_key = crypto::parse_address(&decoded.claims.key)
            .map_err(|_| RpcError::Unauthorized("invalid jwt session key".to_string()))?;

        if !registry.is_active_key_of(wallet, session_key).await {
            return Err(RpcError::Unauthorized(
                "session key revoked or expired".to_string(),
            ));
        }

        Ok((
            wallet,
            session_key,
            AuthVerifyResponse {
                address: address_key(wallet),
                session_key: address_key(session_key),
                jwt_token: token.to_string(),
            },
        ))
    }

    fn issue_jwt(
        &self,
        wallet: Address,
        session_key: Address,
        scope: &str,
        expires_at: u64,
    ) -> Result<String, RpcError> {
        let exp = if expires_at == 0 {
            now_ms() / 1000 + 24 * 3600
        } else {
            expires_at / 1000
        };
        let claims = JwtClaims {
            sub: address_key(wallet),
            key: address_key(session_key),
            scope: scope.to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| RpcError::Internal(format!("jwt encoding failed: {}", e)))
    }

    /// Drop the connection's pending challenge, if any.
    pub fn forget_connection(&self, connection_id: u64) {
        self.challenges.remove(&connection_id);
    }

    /// Background reaper: drop challenges past their TTL.
    pub fn prune_expired(&self) -> usize {
        let now = now_ms();
        let before = self.challenges.len();
        self.challenges
            .retain(|_, pending| now <= pending.issued_at + self.challenge_ttl_ms);
        before - self.challenges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemStore;
    use alloy::signers::local::PrivateKeySigner;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn manager(ttl_secs: u64) -> AuthManager {
        AuthManager::new("test-secret".into(), ttl_secs, 31337, Address::repeat_byte(0x99))
    }

    fn registry() -> SessionKeyRegistry {
        SessionKeyRegistry::new(Arc::new(MemStore::new()))
    }

    fn request_params(wallet: Address, session_key: Address) -> AuthRequestParams {
        AuthRequestParams {
            address: wallet,
            session_key,
            application: Address::repeat_byte(0x42),
            allowances: vec![Allowance { asset: "usdc".into(), amount: dec!(500) }],
            expires_at: now_ms() + 3_600_000,
            scope: "app.trade".into(),
        }
    }

    #[tokio::test]
    async fn challenge_flow_mints_session_key_and_jwt() {
        let manager = manager(300);
        let registry = registry();
        let verifier = SigVerifier::offline();
        let signer = PrivateKeySigner::random();
        let session_key = Address::repeat_byte(0x07);

        let challenge = manager.auth_request(1, request_params(signer.address(), session_key));

        let params = request_params(signer.address(), session_key);
        let digest = crypto::policy_digest(
            &challenge.challenge_message,
            &params.scope,
            params.address,
            params.application,
            params.session_key,
            params.expires_at,
            &params.allowances,
            31337,
            Address::repeat_byte(0x99),
        );
        let signature = crypto::sign_digest(&signer, digest).await.unwrap();

        let (wallet, key, response) = manager
            .verify_challenge(1, &challenge.challenge_message, &[signature], &verifier, &registry)
            .await
            .expect("verify failed");

        assert_eq!(wallet, signer.address());
        assert_eq!(key, session_key);
        assert!(!response.jwt_token.is_empty());
        assert_eq!(registry.resolve_signer(session_key).await, Some(wallet));
        assert_eq!(registry.get(session_key).await.unwrap().cap_for("usdc"), dec!(500));

        // Consumed: a replay of the same challenge fails.
        let err = manager
            .verify_challenge(1, &challenge.challenge_message, &[], &verifier, &registry)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("unauthorized:"));
    }

    #[tokio::test]
    async fn personal_sign_fallback_is_accepted() {
        let manager = manager(300);
        let registry = registry();
        let verifier = SigVerifier::offline();
        let signer = PrivateKeySigner::random();
        let session_key = Address::repeat_byte(0x08);

        let challenge = manager.auth_request(3, request_params(signer.address(), session_key));
        let digest = crypto::personal_digest(challenge.challenge_message.as_bytes());
        let signature = crypto::sign_digest(&signer, digest).await.unwrap();

        manager
            .verify_challenge(3, &challenge.challenge_message, &[signature], &verifier, &registry)
            .await
            .expect("personal-sign verify failed");
    }

    #[tokio::test]
    async fn wrong_signer_is_rejected() {
        let manager = manager(300);
        let registry = registry();
        let verifier = SigVerifier::offline();
        let wallet = PrivateKeySigner::random();
        let impostor = PrivateKeySigner::random();
        let session_key = Address::repeat_byte(0x09);

        let challenge = manager.auth_request(4, request_params(wallet.address(), session_key));
        let digest = crypto::personal_digest(challenge.challenge_message.as_bytes());
        let signature = crypto::sign_digest(&impostor, digest).await.unwrap();

        let err = manager
            .verify_challenge(4, &challenge.challenge_message, &[signature], &verifier, &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidSignature(_)));
        assert!(registry.resolve_signer(session_key).await.is_none());
    }

    #[tokio::test]
    async fn newer_auth_request_supersedes_prior_challenge() {
        let manager = manager(300);
        let registry = registry();
        let verifier = SigVerifier::offline();
        let signer = PrivateKeySigner::random();
        let session_key = Address::repeat_byte(0x0A);

        let first = manager.auth_request(5, request_params(signer.address(), session_key));
        let _second = manager.auth_request(5, request_params(signer.address(), session_key));

        let digest = crypto::personal_digest(first.challenge_message.as_bytes());
        let signature = crypto::sign_digest(&signer, digest).await.unwrap();
        let err = manager
            .verify_challenge(5, &first.challenge_message, &[signature], &verifier, &registry)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown challenge"));
    }

    #[tokio::test]
    async fn expired_challenge_is_rejected_and_pruned() {
        let manager = manager(0);
        let registry = registry();
        let verifier = SigVerifier::offline();
        let signer = PrivateKeySigner::random();
        let session_key = Address::repeat_byte(0x0B);

        let challenge = manager.auth_request(6, request_params(signer.address(), session_key));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let digest = crypto::personal_digest(challenge.challenge_message.as_bytes());
        let signature = crypto::sign_digest(&signer, digest).await.unwrap();
        let err = manager
            .verify_challenge(6, &challenge.challenge_message, &[signature], &verifier, &registry)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("challenge expired"));

        manager.auth_request(7, request_params(signer.address(), session_key));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(manager.prune_expired(), 1);
    }

    #[tokio::test]
    async fn jwt_round_trip_reattaches_session() {
        let manager = manager(300);
        let registry = registry();
        let verifier = SigVerifier::offline();
        let signer = PrivateKeySigner::random();
        let session_key = Address::repeat_byte(0x0C);

        let challenge = manager.auth_request(8, request_params(signer.address(), session_key));
        let digest = crypto::personal_digest(challenge.challenge_message.as_bytes());
        let signature = crypto::sign_digest(&signer, digest).await.unwrap();
        let (_, _, response) = manager
            .verify_challenge(8, &challenge.challenge_message, &[signature], &verifier, &registry)
            .await
            .unwrap();

        let (wallet, key, _) = manager
            .verify_jwt(&response.jwt_token, &registry)
            .await
            .expect("jwt verify failed");
        assert_eq!(wallet, signer.address());
        assert_eq!(key, session_key);

        // Revoked key invalidates the token.
        registry.revoke(signer.address(), session_key).await.unwrap();
        let err = manager.verify_jwt(&response.jwt_token, &registry).await.unwrap_err();
        assert!(err.to_string().contains("revoked"));
    }

    #[tokio::test]
    async fn garbage_jwt_is_unauthorized() {
        let manager = manager(300);
        let registry = registry();
        let err = manager.verify_jwt("not-a-jwt", &registry).await.unwrap_err();
        assert!(matches!(err, RpcError::Unauthorized(_)));
    }
}
