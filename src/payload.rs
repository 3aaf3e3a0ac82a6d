//! Operations, workload languages and typed operation payloads.
//!
//! Input payloads are keyed by operation: the operation decides which field
//! set a payload must carry, so a malformed artifact is rejected when it is
//! loaded instead of when a workload tries to read it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Cryptographic operation under test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Aes256Decrypt,
    Aes256Encrypt,
    Ecc256Sign,
    Ecc256Verify,
    Ecc384Sign,
    Ecc384Verify,
    Rsa2048Decrypt,
    Rsa2048Encrypt,
    Rsa3072Decrypt,
    Rsa3072Encrypt,
    Rsa4096Decrypt,
    Rsa4096Encrypt,
    Sha256,
    Sha384,
}

/// What an operation does with its input, which fixes the payload shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Digest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Aes,
    Rsa,
    Ecc,
    Sha,
}

impl Operation {
    pub const ALL: [Operation; 14] = [
        Operation::Aes256Decrypt,
        Operation::Aes256Encrypt,
        Operation::Ecc256Sign,
        Operation::Ecc256Verify,
        Operation::Ecc384Sign,
        Operation::Ecc384Verify,
        Operation::Rsa2048Decrypt,
        Operation::Rsa2048Encrypt,
        Operation::Rsa3072Decrypt,
        Operation::Rsa3072Encrypt,
        Operation::Rsa4096Decrypt,
        Operation::Rsa4096Encrypt,
        Operation::Sha256,
        Operation::Sha384,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Aes256Decrypt => "aes256_decrypt",
            Operation::Aes256Encrypt => "aes256_encrypt",
            Operation::Ecc256Sign => "ecc256_sign",
            Operation::Ecc256Verify => "ecc256_verify",
            Operation::Ecc384Sign => "ecc384_sign",
            Operation::Ecc384Verify => "ecc384_verify",
            Operation::Rsa2048Decrypt => "rsa2048_decrypt",
            Operation::Rsa2048Encrypt => "rsa2048_encrypt",
            Operation::Rsa3072Decrypt => "rsa3072_decrypt",
            Operation::Rsa3072Encrypt => "rsa3072_encrypt",
            Operation::Rsa4096Decrypt => "rsa4096_decrypt",
            Operation::Rsa4096Encrypt => "rsa4096_encrypt",
            Operation::Sha256 => "sha256",
            Operation::Sha384 => "sha384",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Operation::Aes256Decrypt | Operation::Aes256Encrypt => Family::Aes,
            Operation::Ecc256Sign
            | Operation::Ecc256Verify
            | Operation::Ecc384Sign
            | Operation::Ecc384Verify => Family::Ecc,
            Operation::Rsa2048Decrypt
            | Operation::Rsa2048Encrypt
            | Operation::Rsa3072Decrypt
            | Operation::Rsa3072Encrypt
            | Operation::Rsa4096Decrypt
            | Operation::Rsa4096Encrypt => Family::Rsa,
            Operation::Sha256 | Operation::Sha384 => Family::Sha,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Aes256Encrypt
            | Operation::Rsa2048Encrypt
            | Operation::Rsa3072Encrypt
            | Operation::Rsa4096Encrypt => OperationKind::Encrypt,
            Operation::Aes256Decrypt
            | Operation::Rsa2048Decrypt
            | Operation::Rsa3072Decrypt
            | Operation::Rsa4096Decrypt => OperationKind::Decrypt,
            Operation::Ecc256Sign | Operation::Ecc384Sign => OperationKind::Sign,
            Operation::Ecc256Verify | Operation::Ecc384Verify => OperationKind::Verify,
            Operation::Sha256 | Operation::Sha384 => OperationKind::Digest,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownOperation(s.to_string()))
    }
}

/// Implementation language of a workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "c#")]
    CSharp,
    #[serde(rename = "go")]
    Go,
    #[serde(rename = "java")]
    Java,
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "rust")]
    Rust,
    #[serde(rename = "typescript")]
    TypeScript,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::CSharp,
        Language::Go,
        Language::Java,
        Language::Python,
        Language::Rust,
        Language::TypeScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::CSharp => "c#",
            Language::Go => "go",
            Language::Java => "java",
            Language::Python => "python",
            Language::Rust => "rust",
            Language::TypeScript => "typescript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c#" | "csharp" | "dotnet" => Ok(Language::CSharp),
            "go" => Ok(Language::Go),
            "java" => Ok(Language::Java),
            "python" => Ok(Language::Python),
            "rust" => Ok(Language::Rust),
            "typescript" | "ts" => Ok(Language::TypeScript),
            _ => Err(ConfigError::UnknownLanguage(s.to_string())),
        }
    }
}

/// Input for encrypt, sign and digest operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInput {
    pub message: String,
}

/// Input for signature verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyInput {
    pub message: String,
    /// Base64 signature.
    pub signature: String,
}

/// Envelope-encrypted AES-GCM message, all fields base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesDecryptInput {
    pub encrypted_data_key: String,
    pub iv: String,
    pub tag: String,
    pub encrypted_message: String,
}

/// RSA-wrapped AES key plus ciphertext, all fields base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaDecryptInput {
    pub encrypted_aes_key: String,
    pub iv: String,
    pub ciphertext: String,
}

/// Canonical input for one operation.
///
/// Serializes to the bare field set the workloads read, so the wire form is
/// the same JSON object the artifact file holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OperationPayload {
    Message(MessageInput),
    Verify(VerifyInput),
    AesDecrypt(AesDecryptInput),
    RsaDecrypt(RsaDecryptInput),
}

impl OperationPayload {
    /// Parse `raw` with the field set `operation` requires.
    pub fn parse(operation: Operation, raw: &str) -> Result<Self, serde_json::Error> {
        let payload = match (operation.kind(), operation.family()) {
            (OperationKind::Verify, _) => OperationPayload::Verify(serde_json::from_str(raw)?),
            (OperationKind::Decrypt, Family::Aes) => {
                OperationPayload::AesDecrypt(serde_json::from_str(raw)?)
            }
            (OperationKind::Decrypt, _) => OperationPayload::RsaDecrypt(serde_json::from_str(raw)?),
            (OperationKind::Encrypt | OperationKind::Sign | OperationKind::Digest, _) => {
                OperationPayload::Message(serde_json::from_str(raw)?)
            }
        };
        Ok(payload)
    }

    /// Compact JSON handed to the workload.
    pub fn to_json(&self) -> String {
        // Plain string fields only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_round_trip_through_from_str() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("md5".parse::<Operation>().is_err());
    }

    #[test]
    fn serde_names_match_artifact_names() {
        let json = serde_json::to_string(&Operation::Ecc384Verify).unwrap();
        assert_eq!(json, "\"ecc384_verify\"");
        let json = serde_json::to_string(&Language::CSharp).unwrap();
        assert_eq!(json, "\"c#\"");
    }

    #[test]
    fn language_aliases() {
        assert_eq!("csharp".parse::<Language>().unwrap(), Language::CSharp);
        assert_eq!("C#".parse::<Language>().unwrap(), Language::CSharp);
        assert_eq!("ts".parse::<Language>().unwrap(), Language::TypeScript);
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn verify_payload_requires_signature() {
        let err = OperationPayload::parse(Operation::Ecc256Verify, r#"{"message":"hi"}"#);
        assert!(err.is_err());

        let ok = OperationPayload::parse(
            Operation::Ecc256Verify,
            r#"{"message":"hi","signature":"c2ln"}"#,
        )
        .unwrap();
        assert!(matches!(ok, OperationPayload::Verify(ref v) if v.signature == "c2ln"));
    }

    #[test]
    fn decrypt_payload_shape_depends_on_family() {
        let aes = r#"{"encrypted_data_key":"a","iv":"b","tag":"c","encrypted_message":"d"}"#;
        let rsa = r#"{"encrypted_aes_key":"a","iv":"b","ciphertext":"c"}"#;

        assert!(matches!(
            OperationPayload::parse(Operation::Aes256Decrypt, aes).unwrap(),
            OperationPayload::AesDecrypt(_)
        ));
        assert!(OperationPayload::parse(Operation::Aes256Decrypt, rsa).is_err());
        assert!(matches!(
            OperationPayload::parse(Operation::Rsa3072Decrypt, rsa).unwrap(),
            OperationPayload::RsaDecrypt(_)
        ));
    }

    #[test]
    fn wire_form_is_the_bare_object() {
        let p = OperationPayload::parse(Operation::Sha256, r#"{"message":"abc"}"#).unwrap();
        assert_eq!(p.to_json(), r#"{"message":"abc"}"#);
    }
}
