//! `?` / `*` filespec matching with Windows filename semantics.

/// Match `text` against `pattern`, ignoring ASCII case.
///
/// `*` matches any run of characters (including none), `?` exactly one.
/// `*.*` matches every name, dotted or not.
pub fn matches(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "*.*" {
        return true;
    }

    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();
    let text: Vec<char> = text.chars().map(|c| c.to_ascii_lowercase()).collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some(p);
                resume = t;
                p += 1;
            }
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some(c) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some(star_at) => {
                    p = star_at + 1;
                    resume += 1;
                    t = resume;
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_and_case() {
        assert!(matches("Main.MDF", "main.mdf"));
        assert!(!matches("main.mdf", "main.ldf"));
    }

    #[test]
    fn test_star() {
        assert!(matches("*.mdf", "data.mdf"));
        assert!(matches("*.mdf", ".mdf"));
        assert!(matches("data*", "data"));
        assert!(matches("d*t*a", "dxxtyya"));
        assert!(!matches("*.mdf", "data.mdf.bak"));
    }

    #[test]
    fn test_question_mark() {
        assert!(matches("log?.txt", "log1.txt"));
        assert!(!matches("log?.txt", "log.txt"));
    }

    #[test]
    fn test_star_dot_star_matches_undotted() {
        assert!(matches("*.*", "README"));
    }

    #[test]
    fn test_pattern_against_pattern() {
        // Declared filespecs are themselves patterns; a broader pattern covers them.
        assert!(matches("*", "*.mdf"));
        assert!(matches("*.mdf", "*.mdf"));
        assert!(!matches("*.ldf", "*.mdf"));
    }
}
