//! Authorization providers for libvault
//!
//! Namespace-scoped access control consulted by the lifecycle engine
//! before publishing into a namespace. Rules live in an SVN-style config
//! file with group aliases:
//!
//! ```text
//! [groups]
//! modelers = alice, bob
//!
//! [http://acme.com/schemas]
//! * = r
//! @modelers = rw
//!
//! [http://acme.com/schemas/internal]
//! * =
//! charlie = rw
//! ```
//!
//! The longest namespace prefix with an applicable rule wins; within a
//! section a user rule beats a group rule beats `*`.

use crate::error::{RepositoryError, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Access level for repository namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    /// No access
    None,
    /// Read-only access
    Read,
    /// Read/write access
    Write,
}

impl AccessLevel {
    fn rank(self) -> u8 {
        match self {
            AccessLevel::None => 0,
            AccessLevel::Read => 1,
            AccessLevel::Write => 2,
        }
    }

    /// Whether this level satisfies the required level.
    pub fn allows(self, required: AccessLevel) -> bool {
        self.rank() >= required.rank()
    }
}

/// Authorization result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzResult {
    Granted,
    Denied,
}

/// Authorization provider trait
pub trait AuthzProvider: Send + Sync {
    /// Check whether a user has the required access level on a namespace.
    fn check_access(
        &self,
        username: Option<&str>,
        namespace: &str,
        required_level: AccessLevel,
    ) -> AuthzResult;

    fn can_read(&self, username: Option<&str>, namespace: &str) -> bool {
        self.check_access(username, namespace, AccessLevel::Read) == AuthzResult::Granted
    }

    fn can_write(&self, username: Option<&str>, namespace: &str) -> bool {
        self.check_access(username, namespace, AccessLevel::Write) == AuthzResult::Granted
    }
}

/// Provider that grants everything; the default for single-tenant
/// deployments with no authz file configured.
pub struct AllowAllProvider;

impl AuthzProvider for AllowAllProvider {
    fn check_access(&self, _username: Option<&str>, _namespace: &str, _required: AccessLevel) -> AuthzResult {
        AuthzResult::Granted
    }
}

/// One parsed rule line inside a namespace section
#[derive(Debug, Clone)]
struct AccessRule {
    /// `Some(user)` for a user rule, `None` for `*`
    user: Option<String>,
    /// `Some(group)` when the rule names `@group`
    group: Option<String>,
    level: AccessLevel,
}

/// Namespace-scoped rule-file provider
pub struct NamespaceAuthzProvider {
    /// Rules indexed by namespace prefix
    rules: HashMap<String, Vec<AccessRule>>,
    /// Group definitions: group name -> set of users
    groups: HashMap<String, HashSet<String>>,
    /// Access level when no rule applies
    default_access: AccessLevel,
}

impl NamespaceAuthzProvider {
    /// Load a provider from an authz rule file.
    pub fn from_file(path: &Path, default_access: AccessLevel) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| RepositoryError::Storage(format!("cannot read authz file: {}", e)))?;
        Self::parse(&data, default_access)
    }

    fn parse(data: &str, default_access: AccessLevel) -> Result<Self> {
        let mut rules: HashMap<String, Vec<AccessRule>> = HashMap::new();
        let mut groups: HashMap<String, HashSet<String>> = HashMap::new();
        let mut section: Option<String> = None;

        for (line_no, raw) in data.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = Some(line[1..line.len() - 1].trim().to_string());
                continue;
            }
            let (name, value) = line.split_once('=').ok_or_else(|| {
                RepositoryError::Storage(format!("authz line {}: expected 'name = value'", line_no + 1))
            })?;
            let name = name.trim();
            let value = value.trim();

            match section.as_deref() {
                Some("groups") => {
                    let members = value
                        .split(',')
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect();
                    groups.insert(name.to_string(), members);
                }
                Some(namespace) => {
                    let level = match value {
                        "" => AccessLevel::None,
                        "r" => AccessLevel::Read,
                        "rw" => AccessLevel::Write,
                        other => {
                            return Err(RepositoryError::Storage(format!(
                                "authz line {}: unknown access level '{}'",
                                line_no + 1,
                                other
                            )));
                        }
                    };
                    let rule = if name == "*" {
                        AccessRule { user: None, group: None, level }
                    } else if let Some(group) = name.strip_prefix('@') {
                        AccessRule { user: None, group: Some(group.to_string()), level }
                    } else {
                        AccessRule { user: Some(name.to_string()), group: None, level }
                    };
                    rules.entry(namespace.to_string()).or_default().push(rule);
                }
                None => {
                    return Err(RepositoryError::Storage(format!(
                        "authz line {}: rule outside any section",
                        line_no + 1
                    )));
                }
            }
        }

        Ok(Self { rules, groups, default_access })
    }

    fn is_member(&self, group: &str, username: Option<&str>) -> bool {
        match username {
            Some(user) => self
                .groups
                .get(group)
                .map(|members| members.contains(user))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Effective level from one section, if any rule there applies.
    fn section_level(&self, section: &str, username: Option<&str>) -> Option<AccessLevel> {
        let rules = self.rules.get(section)?;

        // User rule beats group rule beats `*`.
        if let Some(user) = username {
            if let Some(rule) = rules.iter().find(|r| r.user.as_deref() == Some(user)) {
                return Some(rule.level);
            }
        }
        let group_level = rules
            .iter()
            .filter(|r| r.group.as_deref().map(|g| self.is_member(g, username)).unwrap_or(false))
            .map(|r| r.level)
            .max_by_key(|l| l.rank());
        if group_level.is_some() {
            return group_level;
        }
        rules
            .iter()
            .find(|r| r.user.is_none() && r.group.is_none())
            .map(|r| r.level)
    }
}

impl AuthzProvider for NamespaceAuthzProvider {
    fn check_access(
        &self,
        username: Option<&str>,
        namespace: &str,
        required_level: AccessLevel,
    ) -> AuthzResult {
        // Longest matching namespace prefix with an applicable rule wins.
        let mut sections: Vec<&String> = self
            .rules
            .keys()
            .filter(|section| namespace == section.as_str() || namespace.starts_with(&format!("{}/", section)))
            .collect();
        sections.sort_by_key(|s| std::cmp::Reverse(s.len()));

        for section in sections {
            if let Some(level) = self.section_level(section, username) {
                return if level.allows(required_level) {
                    AuthzResult::Granted
                } else {
                    AuthzResult::Denied
                };
            }
        }

        if self.default_access.allows(required_level) {
            AuthzResult::Granted
        } else {
            AuthzResult::Denied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
# test rules
[groups]
modelers = alice, bob

[http://acme.com/schemas]
* = r
@modelers = rw

[http://acme.com/schemas/internal]
* =
charlie = rw
"#;

    fn provider() -> NamespaceAuthzProvider {
        NamespaceAuthzProvider::parse(RULES, AccessLevel::None).unwrap()
    }

    #[test]
    fn test_group_member_can_write() {
        let p = provider();
        assert!(p.can_write(Some("alice"), "http://acme.com/schemas"));
        assert!(p.can_write(Some("bob"), "http://acme.com/schemas/finance"));
    }

    #[test]
    fn test_wildcard_grants_read_only() {
        let p = provider();
        assert!(p.can_read(Some("mallory"), "http://acme.com/schemas"));
        assert!(!p.can_write(Some("mallory"), "http://acme.com/schemas"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let p = provider();
        // The internal section revokes the wildcard read.
        assert!(!p.can_read(Some("alice"), "http://acme.com/schemas/internal"));
        assert!(p.can_write(Some("charlie"), "http://acme.com/schemas/internal"));
    }

    #[test]
    fn test_default_access_applies_outside_rules() {
        let p = provider();
        assert!(!p.can_read(Some("alice"), "http://other.org/ns"));

        let open = NamespaceAuthzProvider::parse(RULES, AccessLevel::Write).unwrap();
        assert!(open.can_write(Some("alice"), "http://other.org/ns"));
    }

    #[test]
    fn test_anonymous_gets_wildcard_only() {
        let p = provider();
        assert!(p.can_read(None, "http://acme.com/schemas"));
        assert!(!p.can_write(None, "http://acme.com/schemas"));
    }

    #[test]
    fn test_unknown_level_is_an_error() {
        let result = NamespaceAuthzProvider::parse("[ns]\nalice = rwx\n", AccessLevel::None);
        assert!(result.is_err());
    }

    #[test]
    fn test_allow_all_provider() {
        let p = AllowAllProvider;
        assert!(p.can_write(None, "anything"));
    }
}
