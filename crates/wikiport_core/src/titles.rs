pub const TITLE_SEPARATOR: char = '_';
pub const PATH_DELIMITER: char = '/';

fn is_allowed(c: char) -> bool {
    c.is_alphanumeric()
        || c == TITLE_SEPARATOR
        || c == PATH_DELIMITER
        || matches!(c, '-' | '.' | ',' | '(' | ')' | '\'' | '&' | '+' | '!' | ':')
}

/// Canonical form of a page title: whitespace runs become a single
/// separator, characters outside the allow-list are dropped, leading and
/// trailing whitespace is trimmed. Idempotent; any input is accepted and
/// the result may be empty.
pub fn normalize(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_separator = false;
    for c in title.chars() {
        if c.is_whitespace() {
            if !out.is_empty() {
                pending_separator = true;
            }
            continue;
        }
        if !is_allowed(c) {
            continue;
        }
        if pending_separator {
            out.push(TITLE_SEPARATOR);
            pending_separator = false;
        }
        out.push(c);
    }
    out
}

/// Human-facing form used as the destination page title: separators back to
/// spaces, path delimiters kept.
pub fn display_title(canonical: &str) -> String {
    canonical.replace(TITLE_SEPARATOR, " ")
}

pub fn path_segments(canonical: &str) -> impl Iterator<Item = &str> {
    canonical.split(PATH_DELIMITER).filter(|s| !s.is_empty())
}

pub fn parent_path(canonical: &str) -> Option<&str> {
    canonical
        .rsplit_once(PATH_DELIMITER)
        .map(|(parent, _)| parent)
        .filter(|p| !p.is_empty())
}

pub fn leaf(canonical: &str) -> &str {
    canonical
        .rsplit(PATH_DELIMITER)
        .next()
        .unwrap_or(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_runs_to_one_separator() {
        assert_eq!(normalize("Main Page"), "Main_Page");
        assert_eq!(normalize("Main \t  Page"), "Main_Page");
        assert_eq!(normalize("  Main Page  "), "Main_Page");
    }

    #[test]
    fn normalize_strips_disallowed_characters() {
        assert_eq!(normalize("What\"s | new*"), "Whats_new");
        assert_eq!(normalize("C++ (language)"), "C++_(language)");
        assert_eq!(normalize("Setup/Install Guide"), "Setup/Install_Guide");
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "Main Page",
            "  spaced   out  ",
            "Help:Contents",
            "Ünïcode Tïtle",
            "a/b/c",
            "",
            "   ",
            "already_normal",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn normalize_accepts_empty_and_whitespace_only_input() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize(" \t\n"), "");
    }

    #[test]
    fn display_title_restores_spaces_and_keeps_path() {
        assert_eq!(display_title("Main_Page"), "Main Page");
        assert_eq!(display_title("Home/Setup_Guide"), "Home/Setup Guide");
    }

    #[test]
    fn path_helpers_split_on_the_delimiter() {
        let segments: Vec<&str> = path_segments("Home/Setup/Install").collect();
        assert_eq!(segments, vec!["Home", "Setup", "Install"]);
        assert_eq!(parent_path("Home/Setup/Install"), Some("Home/Setup"));
        assert_eq!(parent_path("Home"), None);
        assert_eq!(leaf("Home/Setup/Install"), "Install");
        assert_eq!(leaf("Home"), "Home");
    }
}
