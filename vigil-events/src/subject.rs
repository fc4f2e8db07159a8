//! Subject filter matching.
//!
//! Subjects are dot-separated tokens. Filters may use two wildcards:
//! `*` matches exactly one token and `>` matches one or more trailing
//! tokens (only valid as the last token).

/// Whether `subject` is matched by `filter`.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(token)) => {
                return !token.is_empty() && filter_tokens.next().is_none();
            }
            (Some("*"), Some(token)) => {
                if token.is_empty() {
                    return false;
                }
            }
            (Some(f), Some(s)) => {
                if f != s || f.is_empty() {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether any filter in `filters` matches `subject`.
pub fn any_matches<S: AsRef<str>>(filters: &[S], subject: &str) -> bool {
    filters
        .iter()
        .any(|filter| subject_matches(filter.as_ref(), subject))
}

/// A publishable subject has no empty tokens and no wildcards.
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|token| !token.is_empty() && token != "*" && token != ">")
}
