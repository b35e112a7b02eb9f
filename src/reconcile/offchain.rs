//! Off-chain mutation capability and the REST client that implements it
//!
//! Every request carries the confirmed transaction hash in `X-Tx-Hash` so the
//! application server can tie the record change to its on-chain authorization.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::action::ActionKind;
use crate::chain::Address;
use crate::types::{FieldError, RelayError, Result};

/// Header carrying the proof of on-chain authorization
pub const TX_HASH_HEADER: &str = "X-Tx-Hash";

/// Proof handed to the off-chain side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainProof {
    pub tx_hash: String,
    /// Contract deployed by a `createOffer()` write
    pub offer_address: Option<Address>,
}

/// Successful off-chain response
#[derive(Debug, Clone, PartialEq)]
pub struct OffchainResponse {
    pub status: u16,
    pub body: Value,
}

impl OffchainResponse {
    /// `offer.ID` from an offer creation response
    pub fn offer_id(&self) -> Option<String> {
        let offer = self.body.get("offer")?;
        match offer.get("ID").or_else(|| offer.get("id"))? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[async_trait]
pub trait OffchainSync: Send + Sync {
    /// Apply the mutation `kind` describes, authorized by `proof`
    async fn apply(&self, kind: &ActionKind, proof: &ChainProof) -> Result<OffchainResponse>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorPayload {
    Message { msg: String },
    Fields(Vec<FieldError>),
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorPayload,
}

/// Read `{"error": {"msg"}}` or `{"error": [{"path", "msg"}]}`
fn parse_error_body(status: StatusCode, body: &str) -> RelayError {
    let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
    let (message, fields) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: ErrorPayload::Message { msg },
        }) => (msg, Vec::new()),
        Ok(ErrorEnvelope {
            error: ErrorPayload::Fields(fields),
        }) => {
            let message = fields
                .iter()
                .map(|f| format!("{}: {}", f.path, f.msg))
                .collect::<Vec<_>>()
                .join("; ");
            (message, fields)
        }
        Err(_) if body.trim().is_empty() => (
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
            Vec::new(),
        ),
        Err(_) => (body.trim().to_string(), Vec::new()),
    };

    RelayError::OffchainSyncFailed {
        status: Some(status.as_u16()),
        message,
        fields,
        retryable,
    }
}

fn transport_error(e: reqwest::Error) -> RelayError {
    let message = if e.is_timeout() {
        "request timed out".to_string()
    } else {
        e.to_string()
    };
    RelayError::OffchainSyncFailed {
        status: e.status().map(|s| s.as_u16()),
        message,
        fields: Vec::new(),
        retryable: e.is_timeout() || e.is_connect(),
    }
}

/// REST client for the application server
pub struct HttpOffchainSync {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpOffchainSync {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("trust-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            http,
        }
    }

    /// Bearer token sent with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn route(
        &self,
        kind: &ActionKind,
        proof: &ChainProof,
    ) -> Result<(Method, String, Option<Value>)> {
        match kind {
            ActionKind::GrantRole { role, subject } => Ok((
                Method::POST,
                format!("{}/user/{}/roles", self.base_url, subject.user_id),
                Some(json!({ "roleID": role.id })),
            )),
            ActionKind::RevokeRole { role, subject } => Ok((
                Method::DELETE,
                format!(
                    "{}/user/{}/roles/{}",
                    self.base_url, subject.user_id, role.id
                ),
                None,
            )),
            ActionKind::CreateOffer { offer } => {
                let contract = proof.offer_address.ok_or_else(|| {
                    RelayError::MissingProof("offer contract address not known".into())
                })?;
                Ok((
                    Method::POST,
                    format!("{}/tender/offer", self.base_url),
                    Some(json!({
                        "contractAddress": contract.to_string(),
                        "title": offer.title,
                        "description": offer.description,
                        "budget": offer.budget,
                        "currency": offer.currency,
                        "proposalSubmissionStart": offer.proposal_submission_start.to_rfc3339(),
                        "proposalSubmissionEnd": offer.proposal_submission_end.to_rfc3339(),
                        "proposalReviewStart": offer.proposal_review_start.to_rfc3339(),
                        "proposalReviewEnd": offer.proposal_review_end.to_rfc3339(),
                    })),
                ))
            }
        }
    }
}

#[async_trait]
impl OffchainSync for HttpOffchainSync {
    async fn apply(&self, kind: &ActionKind, proof: &ChainProof) -> Result<OffchainResponse> {
        let (method, url, body) = self.route(kind, proof)?;
        debug!(%method, %url, tx_hash = %proof.tx_hash, "Applying off-chain mutation");

        let mut request = self
            .http
            .request(method, &url)
            .header(TX_HASH_HEADER, &proof.tx_hash);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let err = parse_error_body(status, &text);
            warn!(%url, status = status.as_u16(), error = %err, "Off-chain mutation rejected");
            return Err(err);
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text.clone()))
        };
        // The server may refuse a mutation with a 2xx status and an `error` field
        if body.get("error").is_some_and(|e| !e.is_null()) {
            let err = parse_error_body(status, &text);
            warn!(%url, status = status.as_u16(), error = %err, "Off-chain mutation refused");
            return Err(err);
        }
        Ok(OffchainResponse {
            status: status.as_u16(),
            body,
        })
    }
}
