//! Filesystem-safe filename sanitization.

/// Sanitizes a candidate filename for safe use on a Linux filesystem.
///
/// - Replaces NUL, `/`, `\`, and control characters with `_`
/// - Trims trailing spaces and dots (leading dots are kept so hidden
///   names like `.gitignore` survive)
/// - Rejects the reserved names `.` and `..`
/// - Caps length at 255 bytes (NAME_MAX), respecting char boundaries
///
/// Returns an empty string when nothing usable remains; callers fall back
/// to their default name.
pub fn sanitize_filename(name: &str) -> String {
    const NAME_MAX: usize = 255;

    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c == '\0' || c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = cleaned.trim_end_matches([' ', '.']);
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return String::new();
    }

    if trimmed.len() > NAME_MAX {
        let mut take = NAME_MAX;
        while take > 0 && !trimmed.is_char_boundary(take) {
            take -= 1;
        }
        trimmed[..take].to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_separators_and_controls() {
        assert_eq!(sanitize_filename("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("file\x00name\x07.txt"), "file_name_.txt");
    }

    #[test]
    fn trims_trailing_dots_and_spaces() {
        assert_eq!(sanitize_filename("file.txt.. "), "file.txt");
    }

    #[test]
    fn keeps_leading_dot() {
        assert_eq!(sanitize_filename(".gitignore"), ".gitignore");
    }

    #[test]
    fn rejects_reserved() {
        assert_eq!(sanitize_filename("."), "");
        assert_eq!(sanitize_filename(".."), "");
        assert_eq!(sanitize_filename("   "), "");
    }

    #[test]
    fn caps_length_on_char_boundary() {
        let long = "é".repeat(200);
        let out = sanitize_filename(&long);
        assert!(out.len() <= 255);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
