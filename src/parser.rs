//! Command string parser
//!
//! Splits a command string such as `node -e "console.log('hi')"` into a
//! program and its arguments:
//! - Unquoted whitespace separates arguments
//! - Single-quoted text is literal
//! - Double-quoted text is literal except for `\"` and `\\`
//! - A backslash outside quotes escapes the next character (`a\ b` is one argument)
//! - Adjacent quoted/unquoted chunks join into one argument (`pre'mid'suf`)

/// Parse error returned when a command string has invalid syntax
#[derive(Debug)]
pub struct ParseError {
    pub message: String,
    /// Byte offset where the problem was detected
    pub offset: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "offset {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for crate::error::ChainError {
    fn from(e: ParseError) -> Self {
        crate::error::ChainError::parse(format!("invalid command string: {}", e))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Split a command string into words.
///
/// Returns an empty vector for blank input.
pub fn split_command(line: &str) -> Result<Vec<String>, ParseError> {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    // a word may be empty but still present, e.g. `''`
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut quote_start = 0;

    let mut chars = line.char_indices();
    while let Some((i, c)) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some((_, n)) if n == '"' || n == '\\' => current.push(n),
                    Some((_, n)) => {
                        current.push('\\');
                        current.push(n);
                    }
                    None => {
                        return Err(ParseError {
                            message: "unterminated double-quoted argument".into(),
                            offset: quote_start,
                        });
                    }
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                ' ' | '\t' | '\r' | '\n' => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                '\'' | '"' => {
                    quote = if c == '\'' { Quote::Single } else { Quote::Double };
                    quote_start = i;
                    in_word = true;
                }
                '\\' => {
                    let (_, n) = chars.next().ok_or_else(|| ParseError {
                        message: "trailing backslash".into(),
                        offset: i,
                    })?;
                    current.push(n);
                    in_word = true;
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        let which = if quote == Quote::Single { "single" } else { "double" };
        return Err(ParseError {
            message: format!("unterminated {}-quoted argument", which),
            offset: quote_start,
        });
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Quote an argument for display in logs.
pub fn quote_arg(s: &str) -> String {
    const NEED_QUOTE: &[char] = &['\'', '"', ' ', '\t', '\r', '\n', '\\'];
    if s.is_empty() {
        "''".to_string()
    } else if s.contains(NEED_QUOTE) {
        format!("'{}'", s.replace('\'', r"'\''"))
    } else {
        s.to_string()
    }
}

/// Render a program and its arguments as one display string.
pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(quote_arg(program))
        .chain(args.iter().map(|a| quote_arg(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_blank() {
        assert!(split_command("").unwrap().is_empty());
        assert!(split_command("   \t").unwrap().is_empty());
    }

    #[test]
    fn test_split_simple() {
        assert_eq!(split_command("ls -l  /tmp").unwrap(), vec!["ls", "-l", "/tmp"]);
    }

    #[test]
    fn test_split_double_quoted_with_single_inside() {
        let words = split_command(r#"node -e "console.log('hi')""#).unwrap();
        assert_eq!(words, vec!["node", "-e", "console.log('hi')"]);
    }

    #[test]
    fn test_split_single_quoted_is_literal() {
        let words = split_command(r#"echo 'a "b" \c'"#).unwrap();
        assert_eq!(words, vec!["echo", r#"a "b" \c"#]);
    }

    #[test]
    fn test_split_escapes_in_double_quotes() {
        let words = split_command(r#"printf "say \"hi\" \n""#).unwrap();
        assert_eq!(words, vec!["printf", r#"say "hi" \n"#]);
    }

    #[test]
    fn test_split_backslash_space() {
        assert_eq!(split_command(r"cat my\ file").unwrap(), vec!["cat", "my file"]);
    }

    #[test]
    fn test_split_mixed_fragments_join() {
        assert_eq!(split_command("echo pre'mid'suf").unwrap(), vec!["echo", "premidsuf"]);
    }

    #[test]
    fn test_split_empty_quoted_argument() {
        assert_eq!(split_command("cmd '' x").unwrap(), vec!["cmd", "", "x"]);
    }

    #[test]
    fn test_split_unterminated_quote_error() {
        let err = split_command("echo 'oops").unwrap_err();
        assert!(err.message.contains("unterminated single-quoted"));
        assert_eq!(err.offset, 5);
    }

    #[test]
    fn test_split_trailing_backslash_error() {
        let err = split_command("echo \\").unwrap_err();
        assert!(err.message.contains("trailing backslash"));
    }

    #[test]
    fn test_display_command_quotes() {
        let shown = display_command("sh", &["-c".into(), "echo hi".into()]);
        assert_eq!(shown, "sh -c 'echo hi'");
    }
}
