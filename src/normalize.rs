//! Patient-name normalization shared by the EDF side and the clinical sheet.

use deunicode::deunicode;

/// Normalizes a patient name for exact comparison
///
/// Transliterates to ASCII (`Nguyễn` → `Nguyen`), upper-cases and collapses
/// whitespace runs to one space. With `remove_spaces` all spaces are
/// dropped. A missing name stays missing.
///
/// ```rust
/// use edfbids::normalize::normalize;
///
/// assert_eq!(normalize(Some("Nguyễn  Văn a"), false).as_deref(), Some("NGUYEN VAN A"));
/// assert_eq!(normalize(Some("Nguyễn Văn A"), true).as_deref(), Some("NGUYENVANA"));
/// assert_eq!(normalize(None, false), None);
/// ```
pub fn normalize(name: Option<&str>, remove_spaces: bool) -> Option<String> {
    let name = name?;
    let ascii = deunicode(name).to_uppercase();
    let collapsed = ascii.split_whitespace().collect::<Vec<_>>().join(" ");

    if remove_spaces {
        Some(collapsed.replace(' ', ""))
    } else {
        Some(collapsed)
    }
}

/// Shorthand for the common non-optional case.
pub fn normalize_name(name: &str) -> String {
    normalize(Some(name), false).unwrap_or_default()
}
