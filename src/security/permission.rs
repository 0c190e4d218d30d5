//! Capability permissions.
//!
//! A grant is a colon-delimited string such as `mcp:tools:call:yfinance`.
//! A call is allowed when at least one grant matches the call's required
//! permission string; with no matching grant the call is denied.
//!
//! Matching walks the *required* segments left to right:
//!
//! - grant has no segment at this position: no match
//! - grant segment is `*`: match, whatever follows
//! - segments differ: no match
//! - required segments exhausted: match (trailing grant segments are ignored)
//!
//! Grants are a flat allow-list. Overlapping grants of different specificity
//! have no precedence between them; the first match decides.

use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

/// Terminal wildcard segment
pub const WILDCARD: &str = "*";

/// Segment separator
pub const SEGMENT_SEPARATOR: char = ':';

static GRANT_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_*-]+(:[A-Za-z0-9_*-]+)*$").expect("static regex"));

/// `true` when `grant` matches `required`
#[must_use]
pub fn grant_matches(grant: &str, required: &str) -> bool {
    let mut granted = grant.split(SEGMENT_SEPARATOR);
    for needed in required.split(SEGMENT_SEPARATOR) {
        match granted.next() {
            None => return false,
            Some(WILDCARD) => return true,
            Some(segment) if segment != needed => return false,
            Some(_) => {}
        }
    }
    true
}

/// Default-deny check of `required` against a set of grants
pub fn has_permission<I, S>(grants: I, required: &str) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    grants
        .into_iter()
        .any(|grant| grant_matches(grant.as_ref(), required))
}

/// `protocol:method:target` with only the first `/` of `method` turned into `:`
#[must_use]
pub fn build_permission(protocol: &str, method: &str, target: Option<&str>) -> String {
    let method = method.replacen('/', ":", 1);
    match target {
        Some(target) => format!("{protocol}:{method}:{target}"),
        None => format!("{protocol}:{method}"),
    }
}

/// Required permission for an MCP method
#[must_use]
pub fn build_mcp_permission(method: &str, target: Option<&str>) -> String {
    build_permission("mcp", method, target)
}

/// Required permission for an A2A method
#[must_use]
pub fn build_a2a_permission(method: &str, target: Option<&str>) -> String {
    build_permission("a2a", method, target)
}

/// `true` when `grant` follows `segment(":" segment)*`
#[must_use]
pub fn is_valid_grant(grant: &str) -> bool {
    GRANT_GRAMMAR.is_match(grant)
}

/// Granted permissions, validated once at load time
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    grants: Vec<String>,
}

impl PermissionSet {
    /// Validate and store grants
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first grant that breaks the grammar.
    pub fn new<I, S>(grants: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let grants: Vec<String> = grants.into_iter().map(Into::into).collect();
        if let Some(bad) = grants.iter().find(|g| !is_valid_grant(g)) {
            return Err(Error::Config(format!("Invalid permission grant '{bad}'")));
        }
        Ok(Self { grants })
    }

    /// Granted strings in configuration order
    #[must_use]
    pub fn grants(&self) -> &[String] {
        &self.grants
    }

    /// Boolean form of [`Self::check`]
    #[must_use]
    pub fn allows(&self, required: &str) -> bool {
        has_permission(&self.grants, required)
    }

    /// Authorize `required`.
    ///
    /// A literal `*` segment in `required` is rejected outright: it would
    /// otherwise only match grants that are themselves wildcards there.
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` when no grant matches.
    pub fn check(&self, required: &str) -> Result<()> {
        let wildcard_in_required = required.split(SEGMENT_SEPARATOR).any(|s| s == WILDCARD);
        if !wildcard_in_required && self.allows(required) {
            return Ok(());
        }
        tracing::warn!(required = required, "Call denied by permission set");
        Err(Error::PermissionDenied(required.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_rest() {
        assert!(has_permission(["mcp:*"], "mcp:call:yfinance"));
        assert!(has_permission(["*"], "a2a:message:send"));
    }

    #[test]
    fn different_target_is_denied() {
        assert!(!has_permission(["mcp:call:yfinance"], "mcp:call:other"));
    }

    #[test]
    fn shorter_grant_without_wildcard_is_denied() {
        assert!(!has_permission(["mcp:call"], "mcp:call:yfinance"));
    }

    #[test]
    fn empty_grant_set_denies_everything() {
        let none: [&str; 0] = [];
        assert!(!has_permission(none, "mcp:tools:list"));
        assert!(!has_permission(none, ""));
    }

    #[test]
    fn longer_grant_satisfies_shorter_requirement() {
        assert!(has_permission(["mcp:tools:call:yfinance"], "mcp:tools"));
    }

    #[test]
    fn exact_grant_matches() {
        assert!(has_permission(["mcp:tools:list"], "mcp:tools:list"));
    }

    #[test]
    fn wildcard_in_the_middle_is_terminal() {
        // Everything after the wildcard is ignored, including "nope".
        assert!(has_permission(["mcp:*:nope"], "mcp:tools:call:x"));
    }

    #[test]
    fn any_matching_grant_allows() {
        assert!(has_permission(
            ["a2a:*", "mcp:tools:list", "mcp:tools:call:weather"],
            "mcp:tools:call:weather"
        ));
    }

    #[test]
    fn builder_replaces_only_first_slash() {
        assert_eq!(
            build_mcp_permission("tools/call", Some("yfinance")),
            "mcp:tools:call:yfinance"
        );
        assert_eq!(build_mcp_permission("a/b/c", None), "mcp:a:b/c");
        assert_eq!(build_mcp_permission("ping", None), "mcp:ping");
        assert_eq!(
            build_a2a_permission("message/send", None),
            "a2a:message:send"
        );
    }

    #[test]
    fn grammar_accepts_and_rejects() {
        assert!(is_valid_grant("mcp:tools:call:*"));
        assert!(is_valid_grant("mcp:tools:call:my-server_2"));
        assert!(!is_valid_grant(""));
        assert!(!is_valid_grant("mcp::call"));
        assert!(!is_valid_grant("mcp:tools/call"));
        assert!(!is_valid_grant("mcp:call "));
    }

    #[test]
    fn permission_set_rejects_invalid_grants() {
        let err = PermissionSet::new(["mcp:*", "bad grant"]).unwrap_err();
        assert!(err.to_string().contains("bad grant"));
    }

    #[test]
    fn check_reports_denial() {
        let set = PermissionSet::new(["mcp:tools:list"]).unwrap();
        assert!(set.check("mcp:tools:list").is_ok());
        let err = set.check("mcp:tools:call:x").unwrap_err();
        assert!(err.is_denial());
    }

    #[test]
    fn check_rejects_wildcard_in_required() {
        let set = PermissionSet::new(["mcp:*"]).unwrap();
        assert!(set.check("mcp:tools:*").is_err());
    }
}
