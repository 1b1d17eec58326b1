//! Name checks for values that end up in compiled artifacts, directory
//! names or composite store keys.

/// Longest accepted project id.
pub const MAX_PROJECT_ID_LEN: usize = 64;

/// An HCL-safe identifier: `[A-Za-z_][A-Za-z0-9_]*`. Input and output
/// names are rendered verbatim as attribute keys and references.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A provider type such as `aws` or `google-beta`. Same as
/// [`is_identifier`] but dashes are allowed after the first character.
pub fn is_provider_type(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A project id: 1 to 64 of `[A-Za-z0-9_-]`. Project ids become directory
/// names and the prefix of queue keys, so separators and dots are refused.
pub fn is_project_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_PROJECT_ID_LEN
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("cidr"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("node-count"));
        assert!(!is_identifier("a\" }\nresource \"x\" \"y\" {\n b"));
    }

    #[test]
    fn provider_types() {
        assert!(is_provider_type("aws"));
        assert!(is_provider_type("google-beta"));
        assert!(!is_provider_type("-aws"));
        assert!(!is_provider_type("aws\" {"));
    }

    #[test]
    fn project_ids() {
        assert!(is_project_id("team-prod_2"));
        assert!(!is_project_id(""));
        assert!(!is_project_id("a:b"));
        assert!(!is_project_id(".."));
        assert!(!is_project_id("../../x"));
        assert!(!is_project_id("team/prod"));
        assert!(!is_project_id(&"x".repeat(MAX_PROJECT_ID_LEN + 1)));
    }
}
