// crypto.rs - Signature schemes and EIP-712 digests
//
// The broker accepts four signing schemes for any payload:
// - raw ECDSA over keccak256(payload)
// - EIP-191 personal-prefix ECDSA
// - EIP-712 typed data ("Policy" for auth grants, "State" for channel states)
// - ERC-1271 contract callback, with ERC-6492 wrapper detection for
//   not-yet-deployed smart wallets
//
// Digest construction must match the custody contract byte for byte.

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::providers::RootProvider;
use alloy::signers::{local::PrivateKeySigner, Signature, Signer};
use alloy::sol;
use alloy::sol_types::SolValue;
use rust_decimal::Decimal;

use crate::error::RpcError;
use crate::model::Allowance;

/// EIP-712 domain name shared with the custody contract.
const DOMAIN_NAME: &str = "clearnode";
const DOMAIN_VERSION: &str = "1";

/// ERC-1271 success return value: bytes4(keccak256("isValidSignature(bytes32,bytes)")).
const ERC1271_MAGIC: [u8; 4] = [0x16, 0x26, 0xba, 0x7e];

/// Fixed 32-byte suffix marking an ERC-6492 wrapped signature.
const ERC6492_MAGIC_SUFFIX: [u8; 32] = [
    0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64,
    0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92,
    0x64, 0x92,
];

sol! {
    #[sol(rpc)]
    contract IERC1271 {
        function isValidSignature(bytes32 hash, bytes signature) external view returns (bytes4);
    }
}

// =============================================================================
// PARSING
// =============================================================================

pub fn parse_address(input: &str) -> Result<Address, RpcError> {
    Address::from_str(input)
        .map_err(|_| RpcError::invalid(format!("invalid address: {}", input)))
}

pub fn parse_b256(input: &str) -> Result<B256, RpcError> {
    B256::from_str(input)
        .map_err(|_| RpcError::invalid(format!("invalid 32-byte id: {}", input)))
}

pub fn parse_signature_bytes(signature: &str) -> Result<Vec<u8>, RpcError> {
    let trimmed = signature.strip_prefix("0x").unwrap_or(signature);
    hex::decode(trimmed)
        .map_err(|e| RpcError::InvalidSignature(format!("invalid signature hex: {}", e)))
}

/// Scale a decimal amount to on-chain token units. Fails on fractional dust
/// below the token's precision rather than rounding silently.
pub fn to_token_units(amount: Decimal, decimals: u8) -> Result<U256, RpcError> {
    let scaled = amount * Decimal::from(10u64.pow(decimals as u32));
    if scaled.fract() != Decimal::ZERO {
        return Err(RpcError::invalid(format!(
            "amount {} has more than {} decimal places",
            amount, decimals
        )));
    }
    if scaled.is_sign_negative() {
        return Err(RpcError::invalid(format!("negative amount: {}", amount)));
    }
    U256::from_str(&scaled.trunc().to_string())
        .map_err(|_| RpcError::invalid(format!("amount out of range: {}", amount)))
}

/// Inverse of `to_token_units`: on-chain units back to a ledger decimal.
pub fn from_token_units(units: U256, decimals: u8) -> Result<Decimal, RpcError> {
    let raw = Decimal::from_str(&units.to_string())
        .map_err(|_| RpcError::invalid(format!("on-chain amount out of range: {}", units)))?;
    Ok(raw / Decimal::from(10u64.pow(decimals as u32)))
}

// =============================================================================
// DIGESTS
// =============================================================================

/// Raw scheme digest.
pub fn raw_digest(payload: &[u8]) -> B256 {
    keccak256(payload)
}

/// EIP-191 personal-message digest.
pub fn personal_digest(payload: &[u8]) -> B256 {
    let mut prefixed = format!("\x19Ethereum Signed Message:\n{}", payload.len()).into_bytes();
    prefixed.extend_from_slice(payload);
    keccak256(&prefixed)
}

fn domain_separator(chain_id: u64, verifying_contract: Address) -> B256 {
    let domain_type_hash = keccak256(
        b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
    );
    let name_hash = keccak256(DOMAIN_NAME.as_bytes());
    let version_hash = keccak256(DOMAIN_VERSION.as_bytes());

    let mut encoded = Vec::with_capacity(5 * 32);
    encoded.extend_from_slice(domain_type_hash.as_slice());
    encoded.extend_from_slice(name_hash.as_slice());
    encoded.extend_from_slice(version_hash.as_slice());
    encoded.extend_from_slice(&U256::from(chain_id).to_be_bytes::<32>());
    encoded.extend_from_slice(&[0u8; 12]);
    encoded.extend_from_slice(verifying_contract.as_slice());

    keccak256(&encoded)
}

fn eip712_digest(domain: B256, struct_hash: B256) -> B256 {
    let mut digest_input = Vec::with_capacity(2 + 32 + 32);
    digest_input.extend_from_slice(&[0x19, 0x01]);
    digest_input.extend_from_slice(domain.as_slice());
    digest_input.extend_from_slice(struct_hash.as_slice());
    keccak256(&digest_input)
}

fn hash_allowances(allowances: &[Allowance]) -> B256 {
    let allowance_type_hash = keccak256(b"Allowance(string asset,string amount)");
    let mut concatenated = Vec::with_capacity(allowances.len() * 32);
    for allowance in allowances {
        let mut encoded = Vec::with_capacity(3 * 32);
        encoded.extend_from_slice(allowance_type_hash.as_slice());
        encoded.extend_from_slice(keccak256(allowance.asset.as_bytes()).as_slice());
        encoded.extend_from_slice(keccak256(allowance.amount.to_string().as_bytes()).as_slice());
        concatenated.extend_from_slice(keccak256(&encoded).as_slice());
    }
    keccak256(&concatenated)
}

/// EIP-712 digest of an auth grant. Signed by the wallet in auth_verify to
/// bind the challenge to the session key and its allowances.
#[allow(clippy::too_many_arguments)]
pub fn policy_digest(
    challenge: &str,
    scope: &str,
    wallet: Address,
    application: Address,
    session_key: Address,
    expires_at: u64,
    allowances: &[Allowance],
    chain_id: u64,
    verifying_contract: Address,
) -> B256 {
    let type_hash = keccak256(
        b"Policy(string challenge,string scope,address wallet,address application,address participant,uint256 expire,Allowance[] allowances)Allowance(string asset,string amount)",
    );

    let mut struct_data = Vec::with_capacity(8 * 32);
    struct_data.extend_from_slice(type_hash.as_slice());
    struct_data.extend_from_slice(keccak256(challenge.as_bytes()).as_slice());
    struct_data.extend_from_slice(keccak256(scope.as_bytes()).as_slice());
    struct_data.extend_from_slice(&[0u8; 12]);
    struct_data.extend_from_slice(wallet.as_slice());
    struct_data.extend_from_slice(&[0u8; 12]);
    struct_data.extend_from_slice(application.as_slice());
    struct_data.extend_from_slice(&[0u8; 12]);
    struct_data.extend_from_slice(session_key.as_slice());
    struct_data.extend_from_slice(&U256::from(expires_at).to_be_bytes::<32>());
    struct_data.extend_from_slice(hash_allowances(allowances).as_slice());

    eip712_digest(
        domain_separator(chain_id, verifying_contract),
        keccak256(&struct_data),
    )
}

/// EIP-712 digest of a channel state. Countersigned by the broker so the
/// custody contract can verify it during settlement.
pub fn channel_state_digest(
    channel_id: B256,
    version: u64,
    participants: &[Address],
    amounts: &[U256],
    chain_id: u64,
    verifying_contract: Address,
) -> B256 {
    let type_hash = keccak256(
        b"State(bytes32 channelId,uint256 version,address[] participants,uint256[] amounts)",
    );

    let mut participant_bytes = Vec::with_capacity(participants.len() * 32);
    for participant in participants {
        participant_bytes.extend_from_slice(&[0u8; 12]);
        participant_bytes.extend_from_slice(participant.as_slice());
    }
    let mut amount_bytes = Vec::with_capacity(amounts.len() * 32);
    for amount in amounts {
        amount_bytes.extend_from_slice(&amount.to_be_bytes::<32>());
    }

    let mut struct_data = Vec::with_capacity(5 * 32);
    struct_data.extend_from_slice(type_hash.as_slice());
    struct_data.extend_from_slice(channel_id.as_slice());
    struct_data.extend_from_slice(&U256::from(version).to_be_bytes::<32>());
    struct_data.extend_from_slice(keccak256(&participant_bytes).as_slice());
    struct_data.extend_from_slice(keccak256(&amount_bytes).as_slice());

    eip712_digest(
        domain_separator(chain_id, verifying_contract),
        keccak256(&struct_data),
    )
}

// =============================================================================
// SIGNING AND RECOVERY
// =============================================================================

/// Sign a prehashed digest, returning the 65-byte signature as 0x hex.
pub async fn sign_digest(signer: &PrivateKeySigner, digest: B256) -> Result<String, RpcError> {
    let signature = signer
        .sign_hash(&digest)
        .await
        .map_err(|e| RpcError::Internal(format!("signing failed: {}", e)))?;
    Ok(format!("0x{}", hex::encode(signature.as_bytes())))
}

/// Sign a payload with the raw scheme (keccak256 of the canonical bytes).
pub async fn sign_payload(signer: &PrivateKeySigner, payload: &[u8]) -> Result<String, RpcError> {
    sign_digest(signer, raw_digest(payload)).await
}

pub fn recover_prehash(digest: B256, signature: &str) -> Result<Address, RpcError> {
    let sig_bytes = parse_signature_bytes(signature)?;
    let sig = Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| RpcError::InvalidSignature(format!("invalid signature format: {}", e)))?;
    sig.recover_address_from_prehash(&digest)
        .map_err(|e| RpcError::InvalidSignature(format!("signature recovery failed: {}", e)))
}

/// Candidate signers of a payload under the EOA schemes, raw first.
/// Callers match candidates against known participant wallets or session
/// keys; an address that matches neither is simply an unknown signer.
pub fn recover_candidates(payload: &[u8], signature: &str) -> Vec<Address> {
    let mut candidates = Vec::with_capacity(2);
    if let Ok(address) = recover_prehash(raw_digest(payload), signature) {
        candidates.push(address);
    }
    if let Ok(address) = recover_prehash(personal_digest(payload), signature) {
        if !candidates.contains(&address) {
            candidates.push(address);
        }
    }
    candidates
}

// =============================================================================
// VERIFIER
// =============================================================================

/// Multi-scheme signature verifier. With a provider attached it also
/// resolves ERC-1271 contract signatures (and ERC-6492 wrapped ones);
/// offline it covers the EOA schemes only.
#[derive(Clone)]
pub struct SigVerifier {
    provider: Option<Arc<RootProvider>>,
}

impl SigVerifier {
    pub fn new(provider: Arc<RootProvider>) -> Self {
        Self { provider: Some(provider) }
    }

    pub fn offline() -> Self {
        Self { provider: None }
    }

    /// True iff some scheme recovers `expected` from `signature` over
    /// the canonical payload bytes.
    pub async fn verify_payload(
        &self,
        payload: &[u8],
        signature: &str,
        expected: Address,
    ) -> Result<bool, RpcError> {
        if recover_candidates(payload, signature).contains(&expected) {
            return Ok(true);
        }
        self.verify_contract(raw_digest(payload), signature, expected)
            .await
    }

    /// True iff some scheme recovers `expected` from `signature` over a
    /// precomputed digest (EIP-712 flows).
    pub async fn verify_digest(
        &self,
        digest: B256,
        signature: &str,
        expected: Address,
    ) -> Result<bool, RpcError> {
        if recover_prehash(digest, signature).ok() == Some(expected) {
            return Ok(true);
        }
        self.verify_contract(digest, signature, expected).await
    }

    /// ERC-1271 callback path. An ERC-6492 wrapper is unwrapped first; the
    /// pre-deploy simulation is left to the custody contract, so an
    /// undeployed wallet simply fails verification here.
    async fn verify_contract(
        &self,
        digest: B256,
        signature: &str,
        expected: Address,
    ) -> Result<bool, RpcError> {
        let Some(provider) = &self.provider else {
            return Ok(false);
        };

        let sig_bytes = parse_signature_bytes(signature)?;
        let inner = match unwrap_erc6492(&sig_bytes) {
            Some(inner) => inner,
            None => sig_bytes,
        };

        let contract = IERC1271::new(expected, provider.clone());
        match contract.isValidSignature(digest, inner.into()).call().await {
            Ok(magic) => Ok(magic.0 == ERC1271_MAGIC),
            Err(_) => Ok(false),
        }
    }
}

/// If `sig` carries the ERC-6492 magic suffix, decode the wrapper and
/// return the inner wallet signature.
fn unwrap_erc6492(sig: &[u8]) -> Option<Vec<u8>> {
    if sig.len() < 32 || sig[sig.len() - 32..] != ERC6492_MAGIC_SUFFIX {
        return None;
    }
    let wrapped = &sig[..sig.len() - 32];
    let (_factory, _factory_calldata, inner) =
        <(Address, alloy::primitives::Bytes, alloy::primitives::Bytes)>::abi_decode(wrapped)
            .ok()?;
    Some(inner.to_vec())
}
