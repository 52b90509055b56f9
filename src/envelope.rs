// envelope.rs - RPC message envelope
//
// Wire shape: {"req"|"res": [id, method, params, ts], "acc"?, "int"?, "sig": [..]}.
// The signature covers the canonical compact JSON of the tuple only, never
// the wrapper. With serde_json's preserve_order feature the tuple
// re-serializes byte-identically to what the sender signed.

use alloy::signers::local::PrivateKeySigner;
use serde_json::{json, Value};

use crate::crypto;
use crate::error::RpcError;

/// Method name used by error responses.
pub const ERROR_METHOD: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// A parsed or locally built RPC message.
#[derive(Debug, Clone)]
pub struct RpcMessage {
    pub direction: Direction,
    pub id: u64,
    pub method: String,
    pub params: Value,
    pub ts: u64,
    /// Optional app session scope.
    pub acc: Option<String>,
    /// Optional intent annotations.
    pub intent: Option<Vec<String>>,
    pub sig: Vec<String>,
}

impl RpcMessage {
    pub fn is_error(&self) -> bool {
        self.direction == Direction::Response && self.method == ERROR_METHOD
    }

    /// Canonical signing bytes: compact JSON of `[id, method, params, ts]`.
    pub fn canonical_payload(&self) -> Vec<u8> {
        let tuple = json!([self.id, self.method, self.params, self.ts]);
        serde_json::to_vec(&tuple).unwrap_or_default()
    }

    /// Full wire form including the wrapper and signatures.
    pub fn to_wire(&self) -> String {
        let key = match self.direction {
            Direction::Request => "req",
            Direction::Response => "res",
        };
        let mut envelope = serde_json::Map::new();
        envelope.insert(
            key.to_string(),
            json!([self.id, self.method, self.params, self.ts]),
        );
        if let Some(acc) = &self.acc {
            envelope.insert("acc".to_string(), json!(acc));
        }
        if let Some(intent) = &self.intent {
            envelope.insert("int".to_string(), json!(intent));
        }
        envelope.insert("sig".to_string(), json!(self.sig));
        Value::Object(envelope).to_string()
    }

    /// First element of the params array, the conventional request object.
    pub fn params_object(&self) -> Value {
        match &self.params {
            Value::Array(items) => items.first().cloned().unwrap_or(json!({})),
            other => other.clone(),
        }
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

pub fn create_request(id: u64, method: &str, params: Value, ts: u64) -> RpcMessage {
    RpcMessage {
        direction: Direction::Request,
        id,
        method: method.to_string(),
        params,
        ts,
        acc: None,
        intent: None,
        sig: Vec::new(),
    }
}

pub fn create_app_request(
    id: u64,
    method: &str,
    params: Value,
    ts: u64,
    app_session_id: &str,
    intent: Option<Vec<String>>,
) -> RpcMessage {
    let mut message = create_request(id, method, params, ts);
    message.acc = Some(app_session_id.to_string());
    message.intent = intent;
    message
}

pub fn create_response(
    id: u64,
    method: &str,
    data: Value,
    ts: u64,
    app_session_id: Option<&str>,
    intent: Option<Vec<String>>,
) -> RpcMessage {
    RpcMessage {
        direction: Direction::Response,
        id,
        method: method.to_string(),
        params: data,
        ts,
        acc: app_session_id.map(|s| s.to_string()),
        intent,
        sig: Vec::new(),
    }
}

/// Error payload: `[reqId, "error", [{"error": "<msg>"}], ts]`.
pub fn create_error_response(
    id: u64,
    error: &RpcError,
    ts: u64,
    app_session_id: Option<&str>,
) -> RpcMessage {
    create_response(
        id,
        ERROR_METHOD,
        json!([{ "error": error.to_string() }]),
        ts,
        app_session_id,
        None,
    )
}

/// Append the broker's raw-scheme signature over the canonical payload.
pub async fn sign_message(
    mut message: RpcMessage,
    signer: &PrivateKeySigner,
) -> Result<RpcMessage, RpcError> {
    let signature = crypto::sign_payload(signer, &message.canonical_payload()).await?;
    message.sig.push(signature);
    Ok(message)
}

// =============================================================================
// PARSING
// =============================================================================

/// Parse one wire frame. Malformed structure fails with `invalid request`
/// and a reason naming what was wrong.
pub fn parse_message(raw: &str) -> Result<RpcMessage, RpcError> {
    let frame: Value = serde_json::from_str(raw)
        .map_err(|e| RpcError::invalid(format!("malformed json: {}", e)))?;
    let envelope = frame
        .as_object()
        .ok_or_else(|| RpcError::invalid("frame is not an object"))?;

    let (direction, tuple) = if let Some(req) = envelope.get("req") {
        (Direction::Request, req)
    } else if let Some(res) = envelope.get("res") {
        (Direction::Response, res)
    } else {
        return Err(RpcError::invalid("missing req or res payload"));
    };

    let items = tuple
        .as_array()
        .ok_or_else(|| RpcError::invalid("payload is not an array"))?;
    if items.len() != 4 {
        return Err(RpcError::invalid(format!(
            "payload arity {} but expected 4",
            items.len()
        )));
    }

    let id = items[0]
        .as_u64()
        .ok_or_else(|| RpcError::invalid("request id is not an unsigned integer"))?;
    let method = items[1]
        .as_str()
        .ok_or_else(|| RpcError::invalid("method is not a string"))?
        .to_string();
    let params = items[2].clone();
    let ts = items[3]
        .as_u64()
        .ok_or_else(|| RpcError::invalid("timestamp is not an unsigned integer"))?;

    let acc = match envelope.get("acc") {
        Some(Value::String(acc)) => Some(acc.clone()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(RpcError::invalid("acc is not a string")),
    };

    let intent = match envelope.get("int") {
        Some(Value::Array(items)) => {
            let mut intents = Vec::with_capacity(items.len());
            for item in items {
                let label = item
                    .as_str()
                    .ok_or_else(|| RpcError::invalid("intent entry is not a string"))?;
                intents.push(label.to_string());
            }
            Some(intents)
        }
        Some(Value::Null) | None => None,
        Some(_) => return Err(RpcError::invalid("int is not an array")),
    };

    let sig = match envelope.get("sig") {
        Some(Value::Array(items)) => {
            let mut signatures = Vec::with_capacity(items.len());
            for item in items {
                let signature = item
                    .as_str()
                    .ok_or_else(|| RpcError::invalid("signature entry is not a string"))?;
                signatures.push(signature.to_string());
            }
            signatures
        }
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(RpcError::invalid("sig is not an array")),
    };

    Ok(RpcMessage {
        direction,
        id,
        method,
        params,
        ts,
        acc,
        intent,
        sig,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_wire_form() {
        let request = create_app_request(
            7,
            "submit_app_state",
            json!([{"appSessionId": "0xabc", "version": 2}]),
            1_690_000_000_000,
            "0xabc",
            Some(vec!["operate".to_string()]),
        );
        let wire = request.to_wire();
        let parsed = parse_message(&wire).expect("parse failed");

        assert_eq!(parsed.direction, Direction::Request);
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.method, "submit_app_state");
        assert_eq!(parsed.ts, 1_690_000_000_000);
        assert_eq!(parsed.acc.as_deref(), Some("0xabc"));
        assert_eq!(parsed.intent, Some(vec!["operate".to_string()]));
        assert_eq!(parsed.canonical_payload(), request.canonical_payload());
    }

    #[test]
    fn canonical_payload_preserves_param_key_order() {
        let wire = r#"{"req":[1,"transfer",[{"zeta":"1","alpha":"2"}],5],"sig":[]}"#;
        let parsed = parse_message(wire).expect("parse failed");
        let canonical = String::from_utf8(parsed.canonical_payload()).unwrap();
        assert_eq!(canonical, r#"[1,"transfer",[{"zeta":"1","alpha":"2"}],5]"#);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(parse_message("not json").is_err());
        assert!(parse_message("[1,2,3]").is_err());
        assert!(parse_message(r#"{"sig":[]}"#).is_err());

        let arity = parse_message(r#"{"req":[1,"ping",{}],"sig":[]}"#).unwrap_err();
        assert!(arity.to_string().contains("arity"));

        let method = parse_message(r#"{"req":[1,42,[{}],5],"sig":[]}"#).unwrap_err();
        assert!(method.to_string().contains("method"));

        let ts = parse_message(r#"{"req":[1,"ping",[{}],"soon"],"sig":[]}"#).unwrap_err();
        assert!(ts.to_string().contains("timestamp"));
    }

    #[test]
    fn error_response_uses_error_method() {
        let error = RpcError::denied("the request has already been processed");
        let response = create_error_response(9, &error, 1000, None);
        assert!(response.is_error());
        assert_eq!(response.method, ERROR_METHOD);

        let wire = response.to_wire();
        assert!(wire.contains("operation denied: the request has already been processed"));
        let parsed = parse_message(&wire).unwrap();
        assert!(parsed.is_error());
        assert_eq!(parsed.id, 9);
    }

    #[tokio::test]
    async fn signing_appends_verifiable_signature() {
        let signer = PrivateKeySigner::random();
        let request = create_request(3, "ping", json!([{}]), 1000);
        let signed = sign_message(request, &signer).await.expect("sign failed");

        assert_eq!(signed.sig.len(), 1);
        let candidates = crypto::recover_candidates(&signed.canonical_payload(), &signed.sig[0]);
        assert!(candidates.contains(&signer.address()));
    }
}
