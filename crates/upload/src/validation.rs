use std::path::{Component, Path};

use crate::error::TransportError;

/// Validates a vault name or upload id used as a directory name.
///
/// Rejects:
/// - Empty names
/// - Absolute paths and Windows prefixes (`C:`, `\\server`)
/// - `.` and `..`
/// - Anything with more than one path component
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<(), TransportError> {
    if name.is_empty() {
        return Err(TransportError::Fatal(format!("empty {kind}")));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name => Ok(()),
        (Some(Component::ParentDir), _) => Err(TransportError::Fatal(format!(
            "parent directory traversal not allowed in {kind}: {name}"
        ))),
        (Some(Component::RootDir | Component::Prefix(_)), _) => Err(TransportError::Fatal(
            format!("absolute path not allowed in {kind}: {name}"),
        )),
        _ => Err(TransportError::Fatal(format!(
            "{kind} must be a single path component: {name}"
        ))),
    }
}
