//! Environment policy for spawned shells.
//!
//! A shell only ever sees an allow-listed environment: a handful of
//! terminal/locale/path variables plus anything in an internal-tool
//! namespace (`OPENCLAW_*` by default). Names that look like credentials are
//! denied even when they would otherwise be allowed.

use std::collections::BTreeMap;

/// Variables always passed through (terminal type, locale, home, path, color flags).
pub const ALWAYS_ALLOWED: &[&str] = &[
    "TERM",
    "COLORTERM",
    "LANG",
    "LANGUAGE",
    "LC_ALL",
    "LC_CTYPE",
    "HOME",
    "PATH",
    "USER",
    "SHELL",
    "FORCE_COLOR",
    "CLICOLOR",
    "CLICOLOR_FORCE",
    "NO_COLOR",
];

/// Substrings that mark a variable name as credential-like.
pub const CREDENTIAL_MARKERS: &[&str] = &[
    "KEY",
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "AUTH",
    "CREDENTIAL",
    "PRIVATE",
];

/// Name prefixes used by third-party API credentials.
pub const THIRD_PARTY_PREFIXES: &[&str] = &[
    "OPENAI_",
    "ANTHROPIC_",
    "AWS_",
    "AZURE_",
    "GCP_",
    "GOOGLE_",
    "GITHUB_",
    "GH_",
    "HF_",
    "HUGGINGFACE_",
    "STRIPE_",
    "SLACK_",
];

/// Default internal-tool namespace prefix.
pub const DEFAULT_NAMESPACE_PREFIX: &str = "OPENCLAW_";

/// Terminal type set when the source environment has none.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Color capability set when the source environment has none.
pub const DEFAULT_COLORTERM: &str = "truecolor";

/// Allow/deny policy applied to a shell's environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPolicy {
    namespace_prefixes: Vec<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self::new(vec![DEFAULT_NAMESPACE_PREFIX.to_string()])
    }
}

impl EnvPolicy {
    /// Creates a policy that additionally admits the given name prefixes.
    pub fn new(namespace_prefixes: Vec<String>) -> Self {
        Self {
            namespace_prefixes: namespace_prefixes
                .into_iter()
                .map(|p| p.to_ascii_uppercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Returns true if a variable name looks like it carries a credential.
    pub fn is_credential_like(name: &str) -> bool {
        let upper = name.to_ascii_uppercase();
        CREDENTIAL_MARKERS.iter().any(|m| upper.contains(m))
            || THIRD_PARTY_PREFIXES.iter().any(|p| upper.starts_with(p))
    }

    /// Returns true if the allow-list admits this name (before the deny pass).
    pub fn is_allow_listed(&self, name: &str) -> bool {
        ALWAYS_ALLOWED.contains(&name)
            || self
                .namespace_prefixes
                .iter()
                .any(|p| name.to_ascii_uppercase().starts_with(p.as_str()))
    }

    /// Returns true if the variable may reach the shell.
    pub fn permits(&self, name: &str) -> bool {
        self.is_allow_listed(name) && !Self::is_credential_like(name)
    }

    /// Filters `vars` down to the permitted set, sorted by name.
    pub fn sanitize<I, K, V>(&self, vars: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut kept = BTreeMap::new();
        for (name, value) in vars {
            let name = name.into();
            if self.permits(&name) {
                kept.insert(name, value.into());
            } else {
                tracing::trace!(name = %name, "Dropping variable from shell environment");
            }
        }
        kept.into_iter().collect()
    }

    /// Sanitizes `vars` and fills in terminal defaults the shell expects.
    pub fn build<I, K, V>(&self, vars: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env: BTreeMap<String, String> = self.sanitize(vars).into_iter().collect();
        env.entry("TERM".to_string())
            .or_insert_with(|| DEFAULT_TERM.to_string());
        env.entry("COLORTERM".to_string())
            .or_insert_with(|| DEFAULT_COLORTERM.to_string());
        env.into_iter().collect()
    }

    /// Builds the shell environment from this process's own environment.
    pub fn from_host(&self) -> Vec<(String, String)> {
        self.build(std::env::vars())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(env: &[(String, String)]) -> Vec<&str> {
        env.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn test_sanitize_reference_environment() {
        let policy = EnvPolicy::default();
        let env = policy.sanitize(vec![
            ("API_KEY", "abc"),
            ("MY_TOKEN", "xyz"),
            ("PATH", "/bin"),
            ("OPENCLAW_HOME", "/x"),
        ]);

        assert_eq!(
            env,
            vec![
                ("OPENCLAW_HOME".to_string(), "/x".to_string()),
                ("PATH".to_string(), "/bin".to_string()),
            ]
        );
    }

    #[test]
    fn test_unlisted_variables_are_dropped() {
        let policy = EnvPolicy::default();
        let env = policy.sanitize(vec![("EDITOR", "vim"), ("DATABASE_URL", "postgres://")]);
        assert!(env.is_empty());
    }

    #[test]
    fn test_deny_overrides_namespace_allow() {
        let policy = EnvPolicy::default();
        let env = policy.sanitize(vec![
            ("OPENCLAW_GATEWAY_TOKEN", "t"),
            ("OPENCLAW_API_KEY", "k"),
            ("OPENCLAW_AUTH_MODE", "m"),
            ("OPENCLAW_PRIVATE_DIR", "/p"),
            ("OPENCLAW_STATE_DIR", "/s"),
        ]);
        assert_eq!(names(&env), vec!["OPENCLAW_STATE_DIR"]);
    }

    #[test]
    fn test_credential_markers_are_case_insensitive() {
        assert!(EnvPolicy::is_credential_like("openclaw_secret"));
        assert!(EnvPolicy::is_credential_like("Db_Password"));
        assert!(EnvPolicy::is_credential_like("GOOGLE_APPLICATION_CREDENTIALS"));
        assert!(!EnvPolicy::is_credential_like("PATH"));
    }

    #[test]
    fn test_third_party_prefixes_are_denied() {
        assert!(EnvPolicy::is_credential_like("OPENAI_ORG"));
        assert!(EnvPolicy::is_credential_like("ANTHROPIC_BASE_URL"));
        assert!(EnvPolicy::is_credential_like("AWS_REGION"));
        assert!(EnvPolicy::is_credential_like("GH_HOST"));
    }

    #[test]
    fn test_custom_namespace_prefix() {
        let policy = EnvPolicy::new(vec!["clawdeck_".to_string()]);
        assert!(policy.permits("CLAWDECK_WORKSPACE"));
        assert!(!policy.permits("OPENCLAW_HOME"));
    }

    #[test]
    fn test_build_adds_terminal_defaults() {
        let policy = EnvPolicy::default();
        let env = policy.build(vec![("PATH", "/usr/bin")]);

        assert!(env.contains(&("TERM".to_string(), DEFAULT_TERM.to_string())));
        assert!(env.contains(&("COLORTERM".to_string(), DEFAULT_COLORTERM.to_string())));
    }

    #[test]
    fn test_build_keeps_existing_term() {
        let policy = EnvPolicy::default();
        let env = policy.build(vec![("TERM", "screen")]);

        assert!(env.contains(&("TERM".to_string(), "screen".to_string())));
    }

    #[test]
    fn test_color_and_locale_flags_pass() {
        let policy = EnvPolicy::default();
        let env = policy.sanitize(vec![
            ("LANG", "en_US.UTF-8"),
            ("LC_ALL", "C.UTF-8"),
            ("FORCE_COLOR", "1"),
            ("NO_COLOR", "1"),
            ("HOME", "/home/u"),
        ]);
        assert_eq!(env.len(), 5);
    }
}
