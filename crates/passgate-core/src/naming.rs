//! Mapping between profile file stems and display names.
//!
//! A profile image named `jane_doe.jpg` belongs to "Jane Doe".

const SEPARATOR: char = '_';

/// Derive a display name from a profile source identifier.
///
/// Splits on `_`, drops empty tokens, upper-cases the first letter of each
/// token and joins them with a single space.
pub fn display_name(id: &str) -> String {
    id.split(SEPARATOR)
        .filter(|token| !token.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

/// File stem under which a newly enrolled person is stored.
///
/// Lower-cases both names and joins every whitespace-separated word with `_`,
/// so `display_name(&enrollment_stem(first, last))` round-trips for plain names.
pub fn enrollment_stem(first: &str, last: &str) -> String {
    first
        .split_whitespace()
        .chain(last.split_whitespace())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
