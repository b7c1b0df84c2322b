//! Expansion of configured paths.
//!
//! Path values may reference environment variables as `%NAME%` and may start
//! with `~/`. Unset variables expand to nothing; a `%` with no closing
//! partner is kept literally.

use std::path::PathBuf;

/// Replace every `%NAME%` in `input` with `lookup(NAME)`, where `NAME` is
/// made of ASCII letters, digits and `_`. `%%` yields a single `%`.
pub fn expand_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(0) => {
                out.push('%');
                rest = &after[1..];
            }
            Some(end) if is_var_name(&after[..end]) => {
                if let Some(value) = lookup(&after[..end]) {
                    out.push_str(&value);
                }
                rest = &after[end + 1..];
            }
            // not a reference; the closing `%` may still open one
            Some(_) => {
                out.push('%');
                rest = after;
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_var_name(name: &str) -> bool {
    name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Resolve a leading `~/` against the home directory.
pub fn expand_tilde(p: &str) -> PathBuf {
    if let Some(stripped) = p.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(p)
}

/// Default root for store directories: `~/.cow-overlay`.
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".cow-overlay"))
        .unwrap_or_else(|| PathBuf::from(".cow-overlay"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str) -> Option<String> {
        match name {
            "ROOT" => Some("/srv/cow".to_string()),
            "USER" => Some("alice".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_expand_vars() {
        assert_eq!(expand_vars("%ROOT%/attrs", env), "/srv/cow/attrs");
        assert_eq!(expand_vars("%ROOT%/%USER%/data", env), "/srv/cow/alice/data");
        assert_eq!(expand_vars("plain/path", env), "plain/path");
    }

    #[test]
    fn test_unset_var_expands_to_nothing() {
        assert_eq!(expand_vars("%NOPE%/blocks", env), "/blocks");
    }

    #[test]
    fn test_unterminated_and_escaped_percent() {
        assert_eq!(expand_vars("50%", env), "50%");
        assert_eq!(expand_vars("a%%b", env), "a%b");
        assert_eq!(expand_vars("%ROOT%/x%y", env), "/srv/cow/x%y");
    }

    #[test]
    fn test_non_names_are_kept() {
        assert_eq!(expand_vars("%a b%", env), "%a b%");
        assert_eq!(expand_vars("50% of 10%", env), "50% of 10%");
        assert_eq!(expand_vars("%x-y%ROOT%", env), "%x-y/srv/cow");
        assert_eq!(expand_vars("%USER_2%x", env), "x");
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/blocks"), home.join("blocks"));
        }
    }
}
