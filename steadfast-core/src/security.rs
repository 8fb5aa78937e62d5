//! Security Gate — zero-trust checks before any network call
//!
//! Two checks, both local and stateless:
//!   1. Scope allow-list: the requested action must be permitted by an
//!      entry that is `*`, an exact match, or a `prefix*` wildcard.
//!   2. Injection scan: case-insensitive substring match against
//!      role-override phrases and code-execution tokens.
//!
//! A scope violation stops the call. Injection findings are reported in the
//! verdict and only stop the call when `block_on_injection` is set.

use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::error::{Result, SteadfastError};

/// Role-override phrases.
const ROLE_OVERRIDE_PATTERNS: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous",
    "ignore the above",
    "disregard previous",
    "disregard all prior",
    "forget your instructions",
    "forget everything above",
    "you are now",
    "pretend you are",
    "new instructions:",
    "system prompt",
    "system:",
    "developer mode",
    "jailbreak",
];

/// Code-fence and code-execution tokens.
const CODE_EXECUTION_PATTERNS: &[&str] = &[
    "```",
    "<script",
    "eval(",
    "exec(",
    "__import__",
    "os.system",
    "subprocess",
    "rm -rf",
];

/// Characters escaped by sanitization.
const ESCAPED_CHARS: &[char] = &[
    '\\', '`', '*', '_', '{', '}', '[', ']', '<', '>', '#', '|', '~',
];

/// What the gate found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    /// Input to send: escaped if sanitization was requested, else unchanged.
    pub sanitized_input: String,
    /// Whether any injection pattern matched.
    pub injection_detected: bool,
    /// Patterns that matched, in scan order.
    pub detected_patterns: Vec<String>,
    /// Whether sanitization was applied, even if nothing needed escaping.
    pub input_sanitized: bool,
}

/// Stateless request validator.
#[derive(Debug, Clone)]
pub struct SecurityGate {
    patterns: Vec<String>,
    block_on_injection: bool,
}

impl SecurityGate {
    /// Gate with the built-in patterns plus any configured extras.
    #[must_use]
    pub fn new(config: &SecurityConfig) -> Self {
        let patterns = ROLE_OVERRIDE_PATTERNS
            .iter()
            .chain(CODE_EXECUTION_PATTERNS)
            .map(|p| (*p).to_string())
            .chain(config.extra_patterns.iter().map(|p| p.to_lowercase()))
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            patterns,
            block_on_injection: config.block_on_injection,
        }
    }

    /// Validate one request.
    ///
    /// # Errors
    /// `ScopeViolation` if `requested_scope` is not permitted by
    /// `allowed_scopes`; `InjectionBlocked` if patterns matched and blocking
    /// is configured.
    pub fn validate(
        &self,
        input: &str,
        requested_scope: Option<&str>,
        allowed_scopes: &[String],
        sanitize: bool,
    ) -> Result<GateVerdict> {
        if let Some(scope) = requested_scope {
            check_scope(scope, allowed_scopes)?;
        }

        let detected_patterns = self.scan(input);
        let injection_detected = !detected_patterns.is_empty();
        if injection_detected {
            warn!(patterns = ?detected_patterns, "Injection patterns detected in input");
            if self.block_on_injection {
                return Err(SteadfastError::InjectionBlocked {
                    patterns: detected_patterns,
                });
            }
        }

        let sanitized_input = if sanitize {
            sanitize_input(input)
        } else {
            input.to_string()
        };

        Ok(GateVerdict {
            input_sanitized: sanitize,
            sanitized_input,
            injection_detected,
            detected_patterns,
        })
    }

    /// Patterns found in `input`.
    #[must_use]
    pub fn scan(&self, input: &str) -> Vec<String> {
        let lower = input.to_lowercase();
        self.patterns
            .iter()
            .filter(|p| lower.contains(p.as_str()))
            .cloned()
            .collect()
    }
}

impl Default for SecurityGate {
    fn default() -> Self {
        Self::new(&SecurityConfig::default())
    }
}

/// Check `scope` against an allow-list.
///
/// # Errors
/// `ScopeViolation` when no entry permits the scope.
pub fn check_scope(scope: &str, allowed_scopes: &[String]) -> Result<()> {
    let permitted = allowed_scopes.iter().any(|entry| {
        entry == "*"
            || entry == scope
            || entry
                .strip_suffix('*')
                .is_some_and(|prefix| scope.starts_with(prefix))
    });
    if permitted {
        Ok(())
    } else {
        debug!(scope, "Scope not on allow-list");
        Err(SteadfastError::ScopeViolation {
            scope: scope.to_string(),
            allowed: allowed_scopes.to_vec(),
        })
    }
}

/// Backslash-escape markdown and prompt meta characters.
#[must_use]
pub fn sanitize_input(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + input.len() / 8);
    for c in input.chars() {
        if ESCAPED_CHARS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
