//! Canonical global-id handling.
//!
//! External entity ids are persisted in GID form `gid://store/<Type>/<n>`.
//! Numeric-only ids are accepted on input and normalized; ids already in GID
//! form are rebuilt so the type segment matches the expected kind.

pub fn normalize(kind: &str, id: &str) -> String {
    let id = id.trim();
    match numeric_part(id) {
        Some(n) => format!("gid://store/{kind}/{n}"),
        None => id.to_string(),
    }
}

/// Trailing numeric segment of a GID, or the whole string when it is already
/// numeric.
pub fn numeric_part(id: &str) -> Option<&str> {
    let candidate = if id.starts_with("gid://") {
        id.rsplit('/').next()?
    } else {
        id
    };
    (!candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit())).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_are_normalized() {
        assert_eq!(normalize("Product", "123"), "gid://store/Product/123");
        assert_eq!(normalize("Article", " 42 "), "gid://store/Article/42");
    }

    #[test]
    fn gid_type_segment_is_rebuilt() {
        assert_eq!(
            normalize("Article", "gid://store/OnlineStoreArticle/42"),
            "gid://store/Article/42"
        );
        assert_eq!(
            normalize("Product", "gid://store/Product/123"),
            "gid://store/Product/123"
        );
    }

    #[test]
    fn non_numeric_ids_pass_through() {
        assert_eq!(normalize("Product", "gid://store/Product/abc"), "gid://store/Product/abc");
        assert_eq!(numeric_part("gid://store/Product/abc"), None);
        assert_eq!(numeric_part(""), None);
    }

    #[test]
    fn numeric_part_of_gid() {
        assert_eq!(numeric_part("gid://store/Product/123"), Some("123"));
        assert_eq!(numeric_part("456"), Some("456"));
    }
}
