#![forbid(unsafe_code)]

/// Characters that are rejected in file names on at least one supported
/// platform.
pub const FORBIDDEN_FILENAME_CHARS: [char; 9] = ['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Strips every forbidden character and leaves the rest untouched. Distinct
/// inputs may collapse to the same name; callers accept that.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !FORBIDDEN_FILENAME_CHARS.contains(c))
        .collect()
}
