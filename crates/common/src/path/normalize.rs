// Store path canonicalization: NFKC normalization, traversal rejection.
//
// Every path handed to the local store is vault-relative; normalization
// keeps lookups stable across platforms and blocks escapes from the root.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum allowed path length in characters after normalization.
const MAX_PATH_CHARS: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path exceeds maximum length of {MAX_PATH_CHARS} characters")]
    TooLong,

    #[error("path contains directory traversal component: {0}")]
    Traversal(String),

    #[error("path contains null byte")]
    NullByte,
}

/// Normalize a vault-relative path for storage access.
///
/// Applies Unicode NFKC, unifies separators to `/`, collapses duplicate
/// separators, strips leading/trailing separators, and rejects `.`/`..`
/// components, null bytes, empty input and over-long results.
pub fn normalize_path(input: &str) -> Result<String, PathError> {
    if input.is_empty() {
        return Err(PathError::Empty);
    }
    if input.contains('\0') {
        return Err(PathError::NullByte);
    }

    let unified: String = input
        .nfkc()
        .map(|c| if c == '\\' { '/' } else { c })
        .collect();

    let mut components = Vec::new();
    for component in unified.split('/') {
        if component.is_empty() {
            continue;
        }
        if component == "." || component == ".." {
            return Err(PathError::Traversal(component.to_string()));
        }
        components.push(component);
    }

    if components.is_empty() {
        return Err(PathError::Empty);
    }

    let result = components.join("/");
    if result.chars().count() > MAX_PATH_CHARS {
        return Err(PathError::TooLong);
    }
    Ok(result)
}
