pub use logos::Span;
use logos::{Lexer, Logos};

// reads hex escapes in the form `x[0-9a-fA-F]+;` and outputs the corresponding character
fn read_hex_escape(
    iter: &mut std::iter::Peekable<impl Iterator<Item = char>>,
) -> Result<char, LexerError> {
    // consume the x
    let _ = iter.next();

    let mut char_code = 0u32;
    while let Some(c) = iter.peek().copied() {
        match c {
            ';' => break,
            c if c.is_ascii_hexdigit() => {
                let digit = c.to_digit(16).ok_or(LexerError::MalformedString)?;
                char_code = char_code
                    .checked_mul(16)
                    .and_then(|code| code.checked_add(digit))
                    .ok_or(LexerError::EscapeTooBig)?;
                _ = iter.next();
            }
            _ => return Err(LexerError::MalformedString),
        }
    }
    if iter.next() != Some(';') {
        return Err(LexerError::MalformedString);
    }
    char::from_u32(char_code).ok_or(LexerError::InvalidCodepoint(char_code))
}

fn process_string(lexer: &mut Lexer<Token>) -> Result<Box<str>, LexerError> {
    let mut string = String::new();

    // Skip the opening quote
    let mut chars = lexer.slice().chars().skip(1).peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.peek().copied() {
                Some('x' | 'X') => string.push(read_hex_escape(&mut chars)?),
                Some(escape) => {
                    string.push(match escape {
                        'a' => '\x07',
                        'b' => '\x08',
                        't' => '\t',
                        'n' => '\n',
                        'r' => '\r',
                        '\\' => '\\',
                        '"' => '"',
                        _ => return Err(LexerError::MalformedString),
                    });
                    _ = chars.next(); // consume
                }
                None => return Err(LexerError::MalformedString),
            },
            c => string.push(c),
        }
    }

    Ok(Box::from(string.as_str()))
}

fn read_integer(lexer: &mut Lexer<Token>) -> Result<i64, LexerError> {
    lexer
        .slice()
        .parse()
        .map_err(|_| LexerError::NumberTooBig)
}

#[derive(thiserror::Error, Debug, PartialEq, Clone, Default)]
pub enum LexerError {
    #[default]
    #[error("invalid token encountered")]
    Invalid,
    #[error("string escape too big")]
    EscapeTooBig,
    #[error("invalid Unicode codepoint: {0}")]
    InvalidCodepoint(u32),
    #[error("malformed string")]
    MalformedString,
    #[error("number literal too big")]
    NumberTooBig,
}

/// Tokens of the s-expression surface syntax.
#[derive(Debug, Clone, PartialEq, Logos)]
#[logos(error = LexerError)]
#[logos(skip r"([ \t\r\n\f]+|;[^\n]*)")]
pub enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("'")]
    Quote,
    #[regex(r#"[a-zA-Z!$%&*/:<=>?^_~][0-9a-zA-Z!$%&*/:<=>?^_~+\-.@]*"#, |l| Box::from(l.slice()))]
    #[token("+", |l| Box::from(l.slice()))]
    #[token("-", |l| Box::from(l.slice()))]
    #[regex(r"[-+][a-zA-Z!$%&*/:<=>?^_~+\-@][0-9a-zA-Z!$%&*/:<=>?^_~+\-.@]*", |l| Box::from(l.slice()))]
    Identifier(Box<str>),
    #[regex("(?i)#t(rue)?", |_| true)]
    #[regex("(?i)#f(alse)?", |_| false)]
    Boolean(bool),
    #[regex(r"[-+]?[0-9]+", read_integer)]
    Integer(i64),
    #[regex(r#""([^\\"]|\\.)*""#, process_string)]
    String(Box<str>),
}

impl Token {
    pub fn lexer(source: &str) -> Lexer<Self> {
        <Self as Logos>::lexer(source)
    }
}

#[cfg(test)]
mod tests {
    use super::{LexerError, Token};
    use arbtest::arbtest;
    use assert2::{check, let_assert};

    #[test]
    fn identifier_checklist() {
        macro_rules! test_valid {
            ($source:literal) => {{
                let mut lexer = Token::lexer($source);
                let token = lexer.next();
                let_assert!(Some(Ok(Token::Identifier(_))) = token);
                check!(lexer.slice() == $source);
            }};
        }

        test_valid!("<=?");
        test_valid!("+");
        test_valid!("-");
        test_valid!("+soup+");
        test_valid!("->string");
        test_valid!("a34kTMNs");
        test_valid!("set!");
        test_valid!("the-word-recursion-has-many-meanings");
    }

    #[test]
    fn booleans_ignore_case() {
        check!(Token::lexer("#t").next() == Some(Ok(Token::Boolean(true))));
        check!(Token::lexer("#TrUe").next() == Some(Ok(Token::Boolean(true))));
        check!(Token::lexer("#f").next() == Some(Ok(Token::Boolean(false))));
        check!(Token::lexer("#false").next() == Some(Ok(Token::Boolean(false))));
    }

    #[test]
    fn strings_unescape() {
        check!(Token::lexer(r#""a\nb""#).next() == Some(Ok(Token::String("a\nb".into()))));
        check!(Token::lexer(r#""\x3bb;""#).next() == Some(Ok(Token::String("λ".into()))));
        check!(Token::lexer(r#""\q""#).next() == Some(Err(LexerError::MalformedString)));
    }

    #[test]
    fn comments_and_whitespace_are_skipped() {
        let tokens = Token::lexer("( ; a comment\n  x 'y)")
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        check!(
            tokens
                == vec![
                    Token::LParen,
                    Token::Identifier("x".into()),
                    Token::Quote,
                    Token::Identifier("y".into()),
                    Token::RParen,
                ]
        );
    }

    #[test]
    fn integers_roundtrip() {
        arbtest(|u| {
            let n: i64 = u.arbitrary()?;
            check!(Token::lexer(&n.to_string()).next() == Some(Ok(Token::Integer(n))));
            Ok(())
        });
        check!(
            Token::lexer("99999999999999999999").next() == Some(Err(LexerError::NumberTooBig))
        );
    }
}
