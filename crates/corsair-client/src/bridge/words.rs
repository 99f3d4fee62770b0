//! Command-line word splitting for the shell and tool front ends.

use super::AdaptationError;

/// Split `line` into words.
///
/// Whitespace separates words. Single quotes are literal; double quotes
/// allow backslash escapes; a backslash outside quotes escapes the next
/// character. `""` yields an empty word.
pub fn split_command_line(line: &str) -> Result<Vec<String>, AdaptationError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some('\''), '\'') | (Some('"'), '"') => quote = None,
            (Some('"'), '\\') => match chars.next() {
                Some(next @ ('"' | '\\')) => current.push(next),
                Some(next) => {
                    current.push('\\');
                    current.push(next);
                }
                None => return Err(AdaptationError::UnterminatedQuote),
            },
            (Some(_), _) => current.push(ch),
            (None, '\'' | '"') => {
                quote = Some(ch);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(AdaptationError::UnterminatedQuote);
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
