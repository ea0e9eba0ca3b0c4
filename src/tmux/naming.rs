//! Multiplexer session naming.

use rand::rngs::OsRng;
use rand::RngCore;

/// Longest generated fragment kept from user-provided text.
const MAX_FRAGMENT_CHARS: usize = 32;

/// Normalize arbitrary text into a multiplexer-safe identifier fragment.
///
/// tmux treats `.` and `:` as target separators, so only ASCII alphanumerics,
/// `-` and `_` survive; runs of anything else collapse to one `-`.
pub fn sanitize_fragment(raw: &str, fallback: &str) -> String {
    let mut out = String::new();
    let mut previous_dash = false;
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            previous_dash = false;
            continue;
        }
        if matches!(ch, '-' | '_') {
            if !previous_dash && !out.is_empty() {
                out.push(ch);
                previous_dash = true;
            }
            continue;
        }
        if !previous_dash && !out.is_empty() {
            out.push('-');
            previous_dash = true;
        }
    }
    let trimmed = out.trim_matches(['-', '_']).to_string();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.chars().take(MAX_FRAGMENT_CHARS).collect()
    }
}

/// Build `<prefix>-<tool>-<4 hex>` for a freshly spawned session.
pub fn generate_session_name(prefix: &str, tool_type: &str) -> String {
    let prefix = sanitize_fragment(prefix, "tabmux");
    let tool = sanitize_fragment(tool_type, "shell");
    format!("{prefix}-{tool}-{}", random_hex(4))
}

/// Whether an explicitly requested name is safe to hand to the multiplexer.
pub fn is_valid_session_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
}

/// Lowercase hex string of `len` characters from the OS RNG.
pub fn random_hex(len: usize) -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let hex = format!("{:016x}", u64::from_be_bytes(bytes));
    hex.chars().take(len.min(16)).collect()
}
