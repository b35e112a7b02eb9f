//! Offer factory ABI helpers
//!
//! The factory is an OpenZeppelin `AccessControl` contract. Role identifiers
//! are `keccak256("<NAME>_ROLE")`, except the admin role which is the zero word.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use super::{Address, LogEntry};
use crate::types::{RelayError, Result};

pub const HAS_ROLE: &str = "hasRole(bytes32,address)";
pub const GRANT_ROLE: &str = "grantRole(bytes32,address)";
pub const REVOKE_ROLE: &str = "revokeRole(bytes32,address)";
pub const CREATE_OFFER: &str = "createOffer()";
pub const OFFER_CREATED_EVENT: &str = "OfferCreated(address,address)";

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// First four bytes of the signature hash
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// On-chain role identifier (bytes32)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleId(pub [u8; 32]);

impl RoleId {
    /// Map an application role name to its contract identifier.
    ///
    /// `admin` maps to `DEFAULT_ADMIN_ROLE` (zero). Any other name maps to
    /// `keccak256(upper(name) + "_ROLE")`.
    pub fn from_name(name: &str) -> Self {
        let upper = name.trim().to_uppercase();
        if upper == "ADMIN" || upper == "DEFAULT_ADMIN" {
            return Self([0u8; 32]);
        }
        let identifier = if upper.ends_with("_ROLE") {
            upper
        } else {
            format!("{upper}_ROLE")
        };
        Self(keccak256(identifier.as_bytes()))
    }

    pub fn is_admin(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoleId({self})")
    }
}

fn address_word(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn encode_role_call(signature: &str, role: &RoleId, account: &Address) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&selector(signature));
    data.extend_from_slice(&role.0);
    data.extend_from_slice(&address_word(account));
    data
}

pub fn encode_has_role(role: &RoleId, account: &Address) -> Vec<u8> {
    encode_role_call(HAS_ROLE, role, account)
}

pub fn encode_grant_role(role: &RoleId, account: &Address) -> Vec<u8> {
    encode_role_call(GRANT_ROLE, role, account)
}

pub fn encode_revoke_role(role: &RoleId, account: &Address) -> Vec<u8> {
    encode_role_call(REVOKE_ROLE, role, account)
}

pub fn encode_create_offer() -> Vec<u8> {
    selector(CREATE_OFFER).to_vec()
}

/// Decode a single ABI `bool` return value
pub fn decode_bool(output: &[u8]) -> Result<bool> {
    if output.is_empty() {
        return Err(RelayError::MalformedData(
            "empty result from contract".to_string(),
        ));
    }
    if output.len() < 32 {
        return Err(RelayError::MalformedData(format!(
            "bool return must be 32 bytes, got {}",
            output.len()
        )));
    }
    let word = &output[..32];
    if word[..31].iter().any(|b| *b != 0) || word[31] > 1 {
        return Err(RelayError::MalformedData(
            "return word is not a bool".to_string(),
        ));
    }
    Ok(word[31] == 1)
}

fn topic_address(topic: &str) -> Option<Address> {
    let digits = topic.strip_prefix("0x").unwrap_or(topic);
    if digits.len() != 64 || !digits.is_ascii() {
        return None;
    }
    digits[24..].parse().ok()
}

/// Offer contract deployed by a `createOffer()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferCreated {
    pub offer: Address,
    pub tender: Address,
}

/// Find the `OfferCreated` event in receipt logs, optionally restricted to the factory
pub fn find_offer_created(logs: &[LogEntry], factory: Option<&Address>) -> Option<OfferCreated> {
    let topic0 = format!("0x{}", hex::encode(keccak256(OFFER_CREATED_EVENT.as_bytes())));

    logs.iter()
        .filter(|log| match factory {
            Some(factory) => log
                .address
                .parse::<Address>()
                .map(|a| a == *factory)
                .unwrap_or(false),
            None => true,
        })
        .find_map(|log| {
            if log.topics.len() < 3 || !log.topics[0].eq_ignore_ascii_case(&topic0) {
                return None;
            }
            Some(OfferCreated {
                offer: topic_address(&log.topics[1])?,
                tender: topic_address(&log.topics[2])?,
            })
        })
}
