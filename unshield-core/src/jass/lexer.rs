use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Integer(String),
    Real(String),
    FourCC(String),
    Str(String),
    Comment(String),
    Symbol(&'static str),
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

const SYMBOLS: &[&str] = &[
    "==", "!=", "<=", ">=", "(", ")", "[", "]", ",", "=", "<", ">", "+", "-", "*", "/",
];

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' => i += 1,
            b'\n' => {
                tokens.push(Token {
                    kind: TokenKind::Newline,
                    line,
                });
                line += 1;
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                let start = i + 2;
                let end = src[start..].find('\n').map_or(bytes.len(), |n| start + n);
                let text = src[start..end].trim_end_matches('\r').to_string();
                tokens.push(Token {
                    kind: TokenKind::Comment(text),
                    line,
                });
                i = end;
            }
            b'"' => {
                let start_line = line;
                let start = i + 1;
                let mut j = start;
                loop {
                    match bytes.get(j) {
                        None => {
                            return Err(ParseError::Unterminated {
                                line: start_line,
                                what: "string literal",
                            })
                        }
                        Some(b'\\') => j += 2,
                        Some(b'"') => break,
                        Some(b'\n') => {
                            line += 1;
                            j += 1;
                        }
                        Some(_) => j += 1,
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str(src[start..j].to_string()),
                    line: start_line,
                });
                i = j + 1;
            }
            b'\'' => {
                let start = i + 1;
                let mut j = start;
                loop {
                    match bytes.get(j) {
                        None | Some(b'\n') => {
                            return Err(ParseError::Unterminated {
                                line,
                                what: "rawcode literal",
                            })
                        }
                        Some(b'\\') => j += 2,
                        Some(b'\'') => break,
                        Some(_) => j += 1,
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::FourCC(src[start..j].to_string()),
                    line,
                });
                i = j + 1;
            }
            b'$' => {
                let start = i;
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_hexdigit() {
                    j += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Integer(src[start..j].to_string()),
                    line,
                });
                i = j;
            }
            b'0'..=b'9' | b'.' if c != b'.' || bytes.get(i + 1).map_or(false, u8::is_ascii_digit) => {
                let start = i;
                let mut j = i;
                let hex = c == b'0' && matches!(bytes.get(i + 1), Some(b'x') | Some(b'X'));
                if hex {
                    j += 2;
                    while j < bytes.len() && bytes[j].is_ascii_hexdigit() {
                        j += 1;
                    }
                    tokens.push(Token {
                        kind: TokenKind::Integer(src[start..j].to_string()),
                        line,
                    });
                } else {
                    while j < bytes.len() && bytes[j].is_ascii_digit() {
                        j += 1;
                    }
                    let real = bytes.get(j) == Some(&b'.');
                    if real {
                        j += 1;
                        while j < bytes.len() && bytes[j].is_ascii_digit() {
                            j += 1;
                        }
                    }
                    let text = src[start..j].to_string();
                    tokens.push(Token {
                        kind: if real {
                            TokenKind::Real(text)
                        } else {
                            TokenKind::Integer(text)
                        },
                        line,
                    });
                }
                i = j;
            }
            c if is_ident_start(c) => {
                let start = i;
                let mut j = i;
                while j < bytes.len() && is_ident_char(bytes[j]) {
                    j += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(src[start..j].to_string()),
                    line,
                });
                i = j;
            }
            _ => {
                let rest = &src[i..];
                let Some(symbol) = SYMBOLS.iter().find(|s| rest.starts_with(**s)) else {
                    let ch = rest.chars().next().unwrap_or('?');
                    return Err(ParseError::UnexpectedChar { line, ch });
                };
                tokens.push(Token {
                    kind: TokenKind::Symbol(symbol),
                    line,
                });
                i += symbol.len();
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        line,
    });
    Ok(tokens)
}
