use serde::{Deserialize, Serialize};

/// One configured SOCKS5 instance: listening port, auth mode, UDP flag and
/// cumulative traffic.
///
/// `running` mirrors the lifecycle manager's view and is never trusted from
/// disk; the store always writes it as `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(rename = "noAuth")]
    pub no_auth: bool,
    #[serde(rename = "enableUDP")]
    pub enable_udp: bool,
    pub running: bool,
    #[serde(rename = "uploadBytes")]
    pub upload_bytes: u64,
    #[serde(rename = "downloadBytes")]
    pub download_bytes: u64,
}

/// Rejections raised before any resource is allocated for a rule
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("username and password are required unless noAuth is set")]
    MissingCredentials,
}

impl Rule {
    /// Create an open (no authentication) rule
    pub fn open(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            no_auth: true,
            ..Self::default()
        }
    }

    /// Create a rule guarded by a single username/password pair
    pub fn with_credentials(
        name: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            port,
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Check that the rule can be turned into a listening server
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.port == 0 {
            return Err(RuleError::InvalidPort);
        }
        if !self.no_auth && (self.username.is_empty() || self.password.is_empty()) {
            return Err(RuleError::MissingCredentials);
        }
        Ok(())
    }

    /// Cumulative (upload, download) bytes
    pub fn traffic(&self) -> (u64, u64) {
        (self.upload_bytes, self.download_bytes)
    }
}

/// Pick the first free `rule_<n>` id, starting at `rule_<start>`.
///
/// Deleting rules shrinks the list, so `rule_<len+1>` alone can collide with
/// a surviving id.
pub fn next_rule_id(rules: &[Rule], start: usize) -> String {
    let mut n = start.max(1);
    loop {
        let candidate = format!("rule_{}", n);
        if !rules.iter().any(|r| r.id == candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_open_rule() {
        assert!(Rule::open("test", 1080).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        assert_eq!(Rule::open("test", 0).validate(), Err(RuleError::InvalidPort));
    }

    #[test]
    fn test_validate_requires_credentials_when_auth_enabled() {
        let mut rule = Rule::with_credentials("auth", 1080, "alice", "");
        assert_eq!(rule.validate(), Err(RuleError::MissingCredentials));

        rule.password = "secret".to_string();
        assert!(rule.validate().is_ok());

        // Credentials are ignored once auth is off
        rule.username.clear();
        rule.no_auth = true;
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_next_rule_id_skips_taken_ids() {
        let mut rules = vec![Rule::open("a", 1), Rule::open("b", 2)];
        rules[0].id = "rule_1".to_string();
        rules[1].id = "rule_3".to_string();

        assert_eq!(next_rule_id(&rules, rules.len() + 1), "rule_4");
        assert_eq!(next_rule_id(&rules, 1), "rule_2");
        assert_eq!(next_rule_id(&[], 0), "rule_1");
    }

    #[test]
    fn test_json_field_names() {
        let mut rule = Rule::with_credentials("office", 1081, "bob", "pw");
        rule.id = "rule_7".to_string();
        rule.enable_udp = true;
        rule.upload_bytes = 12;
        rule.download_bytes = 34;

        let value = serde_json::to_value(&rule).expect("serialize");
        assert_eq!(value["id"], "rule_7");
        assert_eq!(value["noAuth"], false);
        assert_eq!(value["enableUDP"], true);
        assert_eq!(value["uploadBytes"], 12);
        assert_eq!(value["downloadBytes"], 34);
    }

    #[test]
    fn test_missing_fields_default() {
        let rule: Rule = serde_json::from_str(r#"{"name":"bare","port":1080}"#).expect("parse");
        assert_eq!(rule.id, "");
        assert!(!rule.no_auth);
        assert_eq!(rule.traffic(), (0, 0));
    }
}
