//! Credential block: a type discriminator plus an opaque payload.
//!
//! The payload is only decoded on demand, through the accessor matching the
//! discriminator. Credentials are passed through untouched otherwise.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Credential discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Ssh,
    Token,
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialType::Ssh => f.write_str("ssh"),
            CredentialType::Token => f.write_str("token"),
        }
    }
}

/// Credential as written in configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "type")]
    pub kind: CredentialType,

    #[serde(default)]
    pub data: serde_yaml::Value,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("data", &"<redacted>")
            .finish()
    }
}

/// SSH key credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCredential {
    pub user: String,
    pub private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredential")
            .field("user", &self.user)
            .field("private_key", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Bearer token credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCredential {
    pub token: String,
}

impl fmt::Debug for TokenCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCredential")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// Decode the payload as an SSH credential.
    pub fn ssh(&self) -> Result<SshCredential, ConfigError> {
        self.decode(CredentialType::Ssh)
    }

    /// Decode the payload as a token credential.
    pub fn token(&self) -> Result<TokenCredential, ConfigError> {
        self.decode(CredentialType::Token)
    }

    fn decode<T: serde::de::DeserializeOwned>(
        &self,
        expected: CredentialType,
    ) -> Result<T, ConfigError> {
        if self.kind != expected {
            return Err(ConfigError::InvalidCredentialType {
                expected,
                actual: self.kind,
            });
        }
        Ok(serde_yaml::from_value(self.data.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Credential {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn decodes_ssh_payload() {
        let cred = parse(
            "type: ssh\ndata:\n  user: deploy\n  privateKey: KEY\n  passphrase: hunter2\n",
        );
        let ssh = cred.ssh().unwrap();
        assert_eq!(ssh.user, "deploy");
        assert_eq!(ssh.private_key, "KEY");
        assert_eq!(ssh.passphrase.as_deref(), Some("hunter2"));
    }

    #[test]
    fn passphrase_is_optional() {
        let cred = parse("type: ssh\ndata:\n  user: deploy\n  privateKey: KEY\n");
        assert_eq!(cred.ssh().unwrap().passphrase, None);
    }

    #[test]
    fn decodes_token_payload() {
        let cred = parse("type: token\ndata:\n  token: abc\n");
        assert_eq!(cred.token().unwrap().token, "abc");
    }

    #[test]
    fn mismatched_discriminator_is_invalid_credential_type() {
        let cred = parse("type: token\ndata:\n  token: abc\n");
        match cred.ssh() {
            Err(ConfigError::InvalidCredentialType { expected, actual }) => {
                assert_eq!(expected, CredentialType::Ssh);
                assert_eq!(actual, CredentialType::Token);
            }
            other => panic!("expected InvalidCredentialType, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_a_parse_error() {
        let cred = parse("type: ssh\ndata:\n  user: deploy\n");
        assert!(matches!(cred.ssh(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn debug_never_prints_secrets() {
        let cred = parse("type: ssh\ndata:\n  user: deploy\n  privateKey: KEY\n");
        assert!(!format!("{cred:?}").contains("KEY"));
        assert!(!format!("{:?}", cred.ssh().unwrap()).contains("KEY"));
    }
}
