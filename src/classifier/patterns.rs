//! Message pattern sets and code mappings for the classifier
//!
//! Pattern sets are compiled once per process and shared by every
//! classifier instance. A pattern that fails to compile is dropped with a
//! warning rather than aborting, since the classifier must stay available
//! on every error path.

use crate::classifier::policy::ErrorKind;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// Compiled pattern set for one failure kind
pub(crate) struct KindPatterns {
    pub kind: ErrorKind,
    pub patterns: Vec<Regex>,
}

/// Pattern sets shared by every classifier instance, compiled on first use
static PATTERN_SETS: Lazy<Vec<KindPatterns>> = Lazy::new(compile_pattern_sets);

/// The shared precompiled pattern sets
pub(crate) fn pattern_sets() -> &'static [KindPatterns] {
    &PATTERN_SETS
}

/// Raw per-kind pattern sources, in taxonomy order
const PATTERN_SOURCES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Syntax,
        &[
            r"(?i)syntax\s*error",
            r"(?i)unexpected\s+token",
            r"(?i)parse\s+error",
            r"(?i)unexpected\s+end\s+of\s+(input|file)",
            r"(?i)invalid\s+json",
            r"(?i)unexpected\s+indent",
        ],
    ),
    (
        ErrorKind::Dependency,
        &[
            r"(?i)module\s+not\s+found",
            r"(?i)cannot\s+find\s+(module|package|crate)",
            r"(?i)unresolved\s+(import|dependency)",
            r"(?i)version\s+conflict",
            r"(?i)missing\s+dependency",
            r"(?i)package\s+.*\s+not\s+installed",
        ],
    ),
    (
        ErrorKind::Environment,
        &[
            r"(?i)permission\s+denied",
            r"(?i)no\s+such\s+file\s+or\s+directory",
            r"(?i)command\s+not\s+found",
            r"(?i)environment\s+variable",
            r"(?i)is\s+not\s+recognized\s+as",
            r"(?i)read-?only\s+file\s+system",
        ],
    ),
    (
        ErrorKind::Logic,
        &[
            r"(?i)assertion\s+(failed|error)",
            r"(?i)index\s+out\s+of\s+(range|bounds)",
            r"(?i)division\s+by\s+zero",
            r"(?i)null\s*pointer",
            r"(?i)undefined\s+is\s+not\s+a\s+function",
            r"(?i)unreachable\s+code",
        ],
    ),
    (
        ErrorKind::Network,
        &[
            r"(?i)connection\s+(refused|reset|closed|aborted)",
            r"(?i)network\s+(error|unreachable)",
            r"(?i)dns\s+(error|failure|lookup)",
            r"(?i)socket\s+hang\s*up",
            r"(?i)timed?\s*out",
            r"(?i)broken\s+pipe",
            r"(?i)host\s+unreachable",
        ],
    ),
    (
        ErrorKind::Api,
        &[
            r"(?i)bad\s+gateway",
            r"(?i)service\s+unavailable",
            r"(?i)gateway\s+time-?out",
            r"(?i)internal\s+server\s+error",
            r"(?i)too\s+many\s+requests",
            r"(?i)rate\s*limit",
            r"(?i)upstream\s+(error|failure)",
            r"(?i)api\s+error",
        ],
    ),
    (
        ErrorKind::Validation,
        &[
            r"(?i)validation\s+(failed|error)",
            r"(?i)invalid\s+(input|value|argument|parameter)",
            r"(?i)schema\s+(mismatch|violation|error)",
            r"(?i)missing\s+required\s+(field|parameter)",
            r"(?i)constraint\s+violat",
        ],
    ),
    (
        ErrorKind::Resource,
        &[
            r"(?i)out\s+of\s+memory",
            r"(?i)no\s+space\s+left\s+on\s+device",
            r"(?i)disk\s+(full|quota)",
            r"(?i)quota\s+exceeded",
            r"(?i)resource\s+exhausted",
            r"(?i)too\s+many\s+open\s+files",
        ],
    ),
    (
        ErrorKind::Authentication,
        &[
            r"(?i)unauthoriz",
            r"(?i)authentication\s+(failed|error|required)",
            r"(?i)invalid\s+(credentials|token|api\s*key)",
            r"(?i)access\s+denied",
            r"(?i)token\s+(expired|revoked)",
            r"(?i)forbidden",
        ],
    ),
];

/// Compile all pattern sets
fn compile_pattern_sets() -> Vec<KindPatterns> {
    PATTERN_SOURCES
        .iter()
        .map(|(kind, sources)| KindPatterns {
            kind: *kind,
            patterns: sources
                .iter()
                .filter_map(|source| match Regex::new(source) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!(kind = %kind, pattern = source, "dropping invalid pattern: {e}");
                        None
                    }
                })
                .collect(),
        })
        .collect()
}

/// Map an HTTP status code to a failure kind
pub(crate) fn kind_for_status(status: u16) -> Option<ErrorKind> {
    match status {
        400 | 422 => Some(ErrorKind::Validation),
        401 | 403 | 407 => Some(ErrorKind::Authentication),
        404 | 405 | 409 | 410 => Some(ErrorKind::Api),
        408 => Some(ErrorKind::Network),
        429 => Some(ErrorKind::Api),
        507 => Some(ErrorKind::Resource),
        500..=599 => Some(ErrorKind::Api),
        _ => None,
    }
}

/// Platform error-code tokens scanned out of messages (or supplied explicitly)
const PLATFORM_CODES: &[(&str, ErrorKind)] = &[
    ("ECONNREFUSED", ErrorKind::Network),
    ("ECONNRESET", ErrorKind::Network),
    ("ECONNABORTED", ErrorKind::Network),
    ("EHOSTUNREACH", ErrorKind::Network),
    ("ENETUNREACH", ErrorKind::Network),
    ("ETIMEDOUT", ErrorKind::Network),
    ("EPIPE", ErrorKind::Network),
    ("EAI_AGAIN", ErrorKind::Network),
    ("ENOMEM", ErrorKind::Resource),
    ("ENOSPC", ErrorKind::Resource),
    ("EMFILE", ErrorKind::Resource),
    ("EACCES", ErrorKind::Environment),
    ("EPERM", ErrorKind::Environment),
    ("ENOENT", ErrorKind::Environment),
];

/// Map a platform error code (connection-refused, out-of-memory, ...) found
/// in the message or passed by the caller to a failure kind
pub(crate) fn kind_for_platform_code(message: &str, explicit_code: Option<&str>) -> Option<(ErrorKind, &'static str)> {
    for (code, kind) in PLATFORM_CODES {
        if explicit_code.is_some_and(|c| c.eq_ignore_ascii_case(code)) || message.contains(code) {
            return Some((*kind, code));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_pattern_sources_compile() {
        for (set, (_, sources)) in pattern_sets().iter().zip(PATTERN_SOURCES) {
            assert_eq!(set.patterns.len(), sources.len());
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(kind_for_status(401), Some(ErrorKind::Authentication));
        assert_eq!(kind_for_status(422), Some(ErrorKind::Validation));
        assert_eq!(kind_for_status(503), Some(ErrorKind::Api));
        assert_eq!(kind_for_status(507), Some(ErrorKind::Resource));
        assert_eq!(kind_for_status(200), None);
    }

    #[test]
    fn test_platform_code_scan() {
        let hit = kind_for_platform_code("Connection refused: ECONNREFUSED", None);
        assert_eq!(hit, Some((ErrorKind::Network, "ECONNREFUSED")));

        let explicit = kind_for_platform_code("low level failure", Some("enomem"));
        assert_eq!(explicit, Some((ErrorKind::Resource, "ENOMEM")));

        assert_eq!(kind_for_platform_code("plain failure", None), None);
    }
}
