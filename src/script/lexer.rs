//! Script lexer.
//!
//! - Strips inline comments (`#` and `//`) outside quotes
//! - Tracks indentation (`Indent`/`Dedent`)
//! - Tags every token with its 1-based source line

use super::ScriptError;

#[derive(Debug, PartialEq, Clone)]
pub enum Token {
    Yield,
    Log,
    Set,
    From,
    Game,
    If,
    Elif,
    Else,
    Repeat,
    And,
    Or,

    Colon,
    Equals,
    NotEquals,
    EqualsAssign,
    Str(String),
    Ident(String),
    Number(String),

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    LParen,
    RParen,

    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Lexeme {
    pub token: Token,
    pub line: usize,
}

pub fn tokenize(input: &str) -> Result<Vec<Lexeme>, ScriptError> {
    let mut out = Vec::new();
    let mut indent_stack = vec![0usize];
    let mut last_line = 0;

    for (line_idx, raw_line) in input.lines().enumerate() {
        let line_no = line_idx + 1;
        last_line = line_no;
        let lex_err = |message: String| ScriptError::Lex {
            line: line_no,
            message,
        };
        let mut push = |token: Token| out.push(Lexeme {
            token,
            line: line_no,
        });

        let line = strip_comment(raw_line);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let indent = raw_line.chars().take_while(|c| *c == ' ').count();
        let top = indent_stack.last().copied().unwrap_or(0);
        if indent > top {
            indent_stack.push(indent);
            push(Token::Indent);
        } else if indent < top {
            while indent_stack.last().is_some_and(|&t| indent < t) {
                indent_stack.pop();
                push(Token::Dedent);
            }
            if indent_stack.last().copied().unwrap_or(0) != indent {
                return Err(lex_err("inconsistent indentation".into()));
            }
        }

        let chars: Vec<char> = trimmed.chars().collect();
        let mut i = 0;
        let two = |i: usize, next: char| i + 1 < chars.len() && chars[i + 1] == next;

        while i < chars.len() {
            match chars[i] {
                ':' => {
                    push(Token::Colon);
                    i += 1;
                }
                '=' if two(i, '=') => {
                    push(Token::Equals);
                    i += 2;
                }
                '=' => {
                    push(Token::EqualsAssign);
                    i += 1;
                }
                '!' if two(i, '=') => {
                    push(Token::NotEquals);
                    i += 2;
                }
                '>' if two(i, '=') => {
                    push(Token::GreaterEqual);
                    i += 2;
                }
                '>' => {
                    push(Token::GreaterThan);
                    i += 1;
                }
                '<' if two(i, '=') => {
                    push(Token::LessEqual);
                    i += 2;
                }
                '<' => {
                    push(Token::LessThan);
                    i += 1;
                }
                '+' => {
                    push(Token::Plus);
                    i += 1;
                }
                '-' => {
                    push(Token::Minus);
                    i += 1;
                }
                '*' => {
                    push(Token::Star);
                    i += 1;
                }
                '/' => {
                    push(Token::Slash);
                    i += 1;
                }
                '%' => {
                    push(Token::Percent);
                    i += 1;
                }
                '(' => {
                    push(Token::LParen);
                    i += 1;
                }
                ')' => {
                    push(Token::RParen);
                    i += 1;
                }

                // Either quote style; the other one may appear inside.
                q @ ('"' | '\'') => {
                    let start = i + 1;
                    match chars[start..].iter().position(|&c| c == q) {
                        Some(end) => {
                            push(Token::Str(chars[start..start + end].iter().collect()));
                            i = start + end + 1;
                        }
                        None => return Err(lex_err(format!("missing closing quote: {raw_line}"))),
                    }
                }

                c if c.is_ascii_digit() => {
                    let start = i;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                    if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                        i += 1;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                    push(Token::Number(chars[start..i].iter().collect()));
                }

                c if c.is_alphabetic() || c == '_' => {
                    let start = i;
                    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    let word: String = chars[start..i].iter().collect();
                    push(match word.to_lowercase().as_str() {
                        "yield" => Token::Yield,
                        "log" => Token::Log,
                        "set" => Token::Set,
                        "from" => Token::From,
                        "game" => Token::Game,
                        "if" => Token::If,
                        "elif" => Token::Elif,
                        "else" => Token::Else,
                        "repeat" => Token::Repeat,
                        "and" => Token::And,
                        "or" => Token::Or,
                        _ => Token::Ident(word),
                    });
                }

                c if c.is_whitespace() => i += 1,

                c => return Err(lex_err(format!("unexpected character '{c}'"))),
            }
        }

        push(Token::Newline);
    }

    while indent_stack.len() > 1 {
        indent_stack.pop();
        out.push(Lexeme {
            token: Token::Dedent,
            line: last_line,
        });
    }
    out.push(Lexeme {
        token: Token::Eof,
        line: last_line,
    });

    Ok(out)
}

/// Cut the line at the first `#` or `//` outside quotes.
fn strip_comment(raw: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, ch) in raw.char_indices() {
        match (ch, quote) {
            ('"' | '\'', None) => quote = Some(ch),
            (c, Some(q)) if c == q => quote = None,
            ('#', None) => return &raw[..i],
            ('/', None) if raw[i..].starts_with("//") => return &raw[..i],
            _ => {}
        }
    }
    raw
}
