use std::sync::LazyLock;

use regex::Regex;

/// Literal phrases the server prints once it accepts connections. Checked in
/// order; wording changes on the server side break this silently.
const BOOT_MARKERS: [&str; 2] = ["Hytale Server Booted!", "Server startup complete"];

/// Warning emitted at boot when the server has no stored auth tokens.
const NO_TOKENS_WARNING: &str = "No server tokens configured";

/// Bare-code patterns are permissive; anything shorter than this is noise.
const MIN_CODE_LEN: usize = 6;

const SUCCESS_PHRASES: [&str; 3] = [
    "Authentication successful",
    "Successfully authenticated",
    "Device authentication complete",
];

const FAILURE_PHRASES: [&str; 3] = [
    "Authentication failed",
    "Failed to authenticate",
    "Device code expired",
];

static URL_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(https?://\S+[?&]user_code=([A-Za-z0-9\-]+)\S*)").unwrap());

static BARE_CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)enter (?:the )?code[:\s]+([A-Za-z0-9\-]+)").unwrap(),
        Regex::new(r"(?i)user code[:\s]+([A-Za-z0-9\-]+)").unwrap(),
        Regex::new(r"(?i)device code[:\s]+([A-Za-z0-9\-]+)").unwrap(),
        Regex::new(r"(?i)\bcode[:\s]+([A-Za-z0-9\-]+)").unwrap(),
    ]
});

static JOIN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"([A-Za-z0-9_]+) joined the (?:game|server)").unwrap(),
        Regex::new(r"Player '?([A-Za-z0-9_]+)'? (?:has )?connected").unwrap(),
    ]
});

static LEAVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"([A-Za-z0-9_]+) left the (?:game|server)").unwrap(),
        Regex::new(r"Player '?([A-Za-z0-9_]+)'? (?:has )?disconnected").unwrap(),
    ]
});

pub fn is_boot_ready(line: &str) -> bool {
    BOOT_MARKERS.iter().any(|marker| line.contains(marker))
}

pub fn is_no_tokens_warning(line: &str) -> bool {
    line.contains(NO_TOKENS_WARNING)
}

/// Extracts a verification URL with an embedded device code. Returns the full
/// URL and the code itself.
pub fn extract_url_code(line: &str) -> Option<(String, String)> {
    let caps = URL_CODE.captures(line)?;
    let url = caps.get(1)?.as_str().to_string();
    let code = caps.get(2)?.as_str().to_string();
    if code.len() < MIN_CODE_LEN {
        return None;
    }
    Some((url, code))
}

/// Extracts a bare device code. Patterns are tried in fixed order; a match
/// shorter than the minimum length is skipped rather than accepted.
pub fn extract_bare_code(line: &str) -> Option<String> {
    for pattern in BARE_CODE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(line) {
            let code = caps[1].to_string();
            if code.len() >= MIN_CODE_LEN {
                return Some(code);
            }
        }
    }
    None
}

pub fn is_auth_success(line: &str) -> bool {
    SUCCESS_PHRASES.iter().any(|phrase| line.contains(phrase))
}

pub fn is_auth_failure(line: &str) -> bool {
    FAILURE_PHRASES.iter().any(|phrase| line.contains(phrase))
}

pub fn extract_join(line: &str) -> Option<String> {
    for pattern in JOIN_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(line) {
            return Some(caps[1].to_string());
        }
    }
    None
}

pub fn extract_leave(line: &str) -> Option<String> {
    for pattern in LEAVE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(line) {
            return Some(caps[1].to_string());
        }
    }
    None
}
