use crate::command::{ESCAPED_PIPE_TOKEN, PIPE_TOKEN};

/// Splits a shell-like command line into program tokens.
///
/// Single quotes are literal, double quotes honour `\"` and `\\`, a backslash
/// outside quotes escapes the next character. An unquoted `|` becomes the
/// stage separator token; a quoted or escaped lone `|` is kept as an argument.
pub fn tokenize_command_line(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                flush(&mut tokens, &mut current, &mut in_token, &mut quoted);
            }
            '|' => {
                flush(&mut tokens, &mut current, &mut in_token, &mut quoted);
                tokens.push(PIPE_TOKEN.to_string());
            }
            '\'' => {
                in_token = true;
                quoted = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(format!("unterminated single quote in: {line}")),
                    }
                }
            }
            '"' => {
                in_token = true;
                quoted = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.peek().copied() {
                            Some(next @ ('"' | '\\')) => {
                                current.push(next);
                                chars.next();
                            }
                            _ => current.push('\\'),
                        },
                        Some(c) => current.push(c),
                        None => return Err(format!("unterminated double quote in: {line}")),
                    }
                }
            }
            '\\' => {
                let Some(next) = chars.next() else {
                    return Err(format!("trailing escape in: {line}"));
                };
                in_token = true;
                quoted = true;
                current.push(next);
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    flush(&mut tokens, &mut current, &mut in_token, &mut quoted);
    Ok(tokens)
}

fn flush(tokens: &mut Vec<String>, current: &mut String, in_token: &mut bool, quoted: &mut bool) {
    if *in_token {
        let token = std::mem::take(current);
        if *quoted && token == PIPE_TOKEN {
            tokens.push(ESCAPED_PIPE_TOKEN.to_string());
        } else {
            tokens.push(token);
        }
    }
    *in_token = false;
    *quoted = false;
}
