use chrono::Utc;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use std::fmt;

use secp256k1::PublicKey;

use super::crypto::{sha256, verify_digest, CryptoError, KeyPair};

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Sender and recipient must differ: {0}")]
    SelfTransfer(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Unknown wallet: {0}")]
    UnknownAccount(String),

    #[error("Transaction not signed")]
    NotSigned,

    #[error("Transaction not found: {0}")]
    NotFound(Uuid),

    #[error("Transaction {0} is part of the block currently being mined")]
    LockedByMining(Uuid),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// A transfer between two wallets.
///
/// `is_verified` and `is_valid` are advisory flags set by pool verification;
/// only the commit protocol decides whether the transfer settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Unique identifier for the transaction
    #[schema(value_type = String, example = "6f1c2a8e-3f5d-4e2b-9c1a-0d4b7e8f9a10")]
    pub id: Uuid,

    /// Sending wallet
    pub from: String,

    /// Receiving wallet
    pub to: String,

    /// Amount being transferred
    #[serde(serialize_with = "serialize_amount")]
    pub amount: f64,

    /// Creation time in epoch milliseconds
    pub timestamp: i64,

    /// DER-encoded ECDSA signature, hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Signature checked against the sender's public key
    #[serde(default)]
    pub is_verified: bool,

    /// Sender balance sufficient as of the last check
    #[serde(default)]
    pub is_valid: bool,
}

/// Whole numbers below this are written without an exponent
const PLAIN_INTEGER_LIMIT: f64 = 1e21;

/// Writes amounts as JSON number literals: `10`, not `10.0`.
/// Hash preimages and signing digests depend on this form.
fn serialize_amount<S: Serializer>(amount: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if amount.is_finite() && amount.fract() == 0.0 && amount.abs() < PLAIN_INTEGER_LIMIT {
        serializer.serialize_i128(*amount as i128)
    } else {
        serializer.serialize_f64(*amount)
    }
}

/// The exact payload covered by a transaction signature
#[derive(Serialize)]
struct SigningPayload<'a> {
    from: &'a str,
    to: &'a str,
    #[serde(serialize_with = "serialize_amount")]
    amount: f64,
    timestamp: i64,
}

impl Transaction {
    /// Creates a new unsigned transaction stamped with the current time
    pub fn new(from: &str, to: &str, amount: f64) -> Self {
        Transaction {
            id: Uuid::new_v4(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            timestamp: Utc::now().timestamp_millis(),
            signature: None,
            is_verified: false,
            is_valid: false,
        }
    }

    /// SHA-256 over the canonical JSON of `{from, to, amount, timestamp}`
    pub fn signing_digest(&self) -> Result<[u8; 32], TransactionError> {
        let payload = SigningPayload {
            from: &self.from,
            to: &self.to,
            amount: self.amount,
            timestamp: self.timestamp,
        };

        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| TransactionError::SerializationError(e.to_string()))?;

        Ok(sha256(&bytes))
    }

    /// Signs the transaction with the sender's key pair
    pub(super) fn sign(&mut self, key_pair: &KeyPair) -> Result<(), TransactionError> {
        let digest = self.signing_digest()?;
        self.signature = Some(key_pair.sign_digest(&digest)?);
        Ok(())
    }

    /// Checks the signature against the sender's public key
    pub fn verify_signature(&self, public_key: &PublicKey) -> Result<bool, TransactionError> {
        let signature = self.signature.as_ref().ok_or(TransactionError::NotSigned)?;
        let digest = self.signing_digest()?;

        verify_digest(&digest, signature, public_key).map_err(TransactionError::from)
    }

    /// Fee charged to the sender at the given rate
    pub fn fee(&self, fee_rate: f64) -> f64 {
        self.amount * fee_rate
    }

    /// Amount plus fee
    pub fn total_cost(&self, fee_rate: f64) -> f64 {
        self.amount + self.fee(fee_rate)
    }

    /// Whether `address` is the sender or the receiver
    pub fn involves(&self, address: &str) -> bool {
        self.from == address || self.to == address
    }
}

/// Lifecycle label recorded in the transaction history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Created,
    /// Audit-only label written right after creation
    Broadcast,
    Verified,
    Mined,
    Failed,
    Cancelled,
}

/// Why a transaction failed verification or settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum FailureReason {
    #[serde(rename = "bad signature")]
    BadSignature,
    #[serde(rename = "insufficient funds")]
    InsufficientFunds,
    #[serde(rename = "unknown account")]
    UnknownAccount,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            FailureReason::BadSignature => "bad signature",
            FailureReason::InsufficientFunds => "insufficient funds",
            FailureReason::UnknownAccount => "unknown account",
        };
        write!(f, "{}", tag)
    }
}

/// One state transition in the append-only transaction history
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Snapshot of the transaction at the time of the transition
    pub transaction: Transaction,

    /// New status
    pub status: TransactionStatus,

    /// Present for `failed` entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,

    /// When the transition happened, epoch milliseconds
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction() {
        let transaction = Transaction::new("Alice", "Bob", 10.5);

        assert_eq!(transaction.from, "Alice");
        assert_eq!(transaction.to, "Bob");
        assert_eq!(transaction.amount, 10.5);
        assert!(transaction.timestamp > 0);
        assert!(transaction.signature.is_none());
        assert!(!transaction.is_verified);
        assert!(!transaction.is_valid);
    }

    #[test]
    fn test_every_transaction_gets_its_own_id() {
        let first = Transaction::new("Alice", "Bob", 1.0);
        let mut second = Transaction::new("Alice", "Bob", 1.0);
        second.timestamp = first.timestamp;

        // Same (from, to, timestamp) but distinct identity
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_signing_digest_covers_only_the_payload() {
        let mut transaction = Transaction::new("Alice", "Bob", 10.0);
        let digest = transaction.signing_digest().unwrap();

        transaction.id = Uuid::new_v4();
        transaction.is_verified = true;
        transaction.is_valid = true;
        transaction.signature = Some("00".to_string());
        assert_eq!(transaction.signing_digest().unwrap(), digest);

        transaction.amount = 11.0;
        assert_ne!(transaction.signing_digest().unwrap(), digest);
    }

    #[test]
    fn test_signing_digest_matches_canonical_json() {
        let mut transaction = Transaction::new("Alice", "Bob", 2.5);
        transaction.timestamp = 1_700_000_000_000;

        let expected = sha256(br#"{"from":"Alice","to":"Bob","amount":2.5,"timestamp":1700000000000}"#);
        assert_eq!(transaction.signing_digest().unwrap(), expected);
    }

    #[test]
    fn test_whole_amounts_have_no_fraction_in_digest() {
        let mut transaction = Transaction::new("Alice", "Bob", 10.0);
        transaction.timestamp = 1_700_000_000_000;

        let expected = sha256(br#"{"from":"Alice","to":"Bob","amount":10,"timestamp":1700000000000}"#);
        assert_eq!(transaction.signing_digest().unwrap(), expected);
    }

    #[test]
    fn test_amount_json_form() {
        let mut transaction = Transaction::new("Alice", "Bob", 10.0);
        transaction.id = Uuid::nil();
        transaction.timestamp = 1_700_000_000_000;

        assert_eq!(
            serde_json::to_string(&transaction).unwrap(),
            r#"{"id":"00000000-0000-0000-0000-000000000000","from":"Alice","to":"Bob","amount":10,"timestamp":1700000000000,"isVerified":false,"isValid":false}"#
        );

        transaction.amount = 0.1;
        assert!(serde_json::to_string(&transaction).unwrap().contains(r#""amount":0.1,"#));

        // Integer literals read back as the same amount
        let parsed: Transaction = serde_json::from_str(
            r#"{"id":"00000000-0000-0000-0000-000000000000","from":"Alice","to":"Bob","amount":10,"timestamp":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(parsed.amount, 10.0);
    }

    #[test]
    fn test_sign_and_verify() {
        let key_pair = KeyPair::generate();
        let mut transaction = Transaction::new("Alice", "Bob", 10.0);

        assert!(matches!(
            transaction.verify_signature(key_pair.public_key()),
            Err(TransactionError::NotSigned)
        ));

        transaction.sign(&key_pair).unwrap();
        assert!(transaction.verify_signature(key_pair.public_key()).unwrap());

        // Tampering with the amount breaks the signature
        transaction.amount = 1000.0;
        assert!(!transaction.verify_signature(key_pair.public_key()).unwrap());
    }

    #[test]
    fn test_fee_and_total_cost() {
        let transaction = Transaction::new("Alice", "Bob", 10.0);

        assert!((transaction.fee(0.001) - 0.01).abs() < 1e-12);
        assert!((transaction.total_cost(0.001) - 10.01).abs() < 1e-12);
        assert_eq!(transaction.total_cost(0.0), 10.0);
    }

    #[test]
    fn test_json_field_names() {
        let transaction = Transaction::new("Alice", "Bob", 1.0);
        let json = serde_json::to_value(&transaction).unwrap();

        assert!(json.get("isVerified").is_some());
        assert!(json.get("isValid").is_some());
        assert!(json.get("signature").is_none());
        assert_eq!(
            serde_json::to_value(FailureReason::BadSignature).unwrap(),
            "bad signature"
        );
        assert_eq!(FailureReason::InsufficientFunds.to_string(), "insufficient funds");
    }
}
