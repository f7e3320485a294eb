//! Turning caller-supplied identifiers into safe directory names.

/// Characters that are invalid in path components on at least one platform.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest component we produce, in characters.
const MAX_COMPONENT_CHARS: usize = 64;

/// Sanitize an owner id so it can be used as a single path component.
///
/// Separators, control characters and characters invalid on Windows become
/// `_` (runs collapse to one), leading/trailing dots and spaces are trimmed so
/// `..` can never escape the artifacts root, reserved device names get a `_`
/// prefix, and the result is capped at 64 characters. Empty input yields
/// `"anonymous"`.
///
/// ```
/// use talkback::utils::filename::sanitize_path_component;
///
/// assert_eq!(sanitize_path_component("../etc/passwd"), "_etc_passwd");
/// assert_eq!(sanitize_path_component("用户?"), "用户_");
/// assert_eq!(sanitize_path_component(""), "anonymous");
/// ```
pub fn sanitize_path_component(input: &str) -> String {
    let mut result = String::with_capacity(input.len().min(MAX_COMPONENT_CHARS * 4));
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || (c.is_whitespace() && c != ' ') || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    let capped: String = trimmed.chars().take(MAX_COMPONENT_CHARS).collect();
    let capped = capped.trim_end_matches(|c| c == ' ' || c == '.');

    if capped.is_empty() {
        return "anonymous".to_string();
    }

    let upper = capped.to_uppercase();
    let stem = upper.split('.').next().unwrap_or_default();
    if WINDOWS_RESERVED_NAMES.contains(&stem) {
        return format!("_{}", capped);
    }

    capped.to_string()
}
