//! Turns source text into [`Expr`] trees.
use crate::{
    expr::{Expr, Literal},
    lexer::{LexerError, Span, Token},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    #[error("{error}")]
    Lexer { error: LexerError, span: Span },
    #[error("unexpected `)`")]
    UnexpectedClose { span: Span },
    #[error("unclosed list")]
    Unclosed { span: Span },
    #[error("expected an expression after `'`")]
    DanglingQuote { span: Span },
}

impl ReadError {
    /// Where in the source the error was found.
    pub fn span(&self) -> Span {
        match self {
            Self::Lexer { span, .. }
            | Self::UnexpectedClose { span }
            | Self::Unclosed { span }
            | Self::DanglingQuote { span } => span.clone(),
        }
    }
}

struct Reader<'src> {
    tokens: std::iter::Peekable<logos::SpannedIter<'src, Token>>,
    end: usize,
}

impl<'src> Reader<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            tokens: Token::lexer(source).spanned().peekable(),
            end: source.len(),
        }
    }

    fn next_token(&mut self) -> Result<Option<(Token, Span)>, ReadError> {
        match self.tokens.next() {
            Some((Ok(token), span)) => Ok(Some((token, span))),
            Some((Err(error), span)) => Err(ReadError::Lexer { error, span }),
            None => Ok(None),
        }
    }

    /// Reads the next complete expression, `None` at the end of input.
    fn read(&mut self) -> Result<Option<Expr>, ReadError> {
        let Some((token, span)) = self.next_token()? else {
            return Ok(None);
        };
        self.read_from(token, span).map(Some)
    }

    fn read_from(&mut self, token: Token, span: Span) -> Result<Expr, ReadError> {
        Ok(match token {
            Token::LParen => {
                let mut items = vec![];
                loop {
                    match self.next_token()? {
                        Some((Token::RParen, _)) => break Expr::Form(items),
                        Some((token, span)) => items.push(self.read_from(token, span)?),
                        None => {
                            return Err(ReadError::Unclosed {
                                span: span.start..self.end,
                            })
                        }
                    }
                }
            }
            Token::RParen => return Err(ReadError::UnexpectedClose { span }),
            Token::Quote => match self.read()? {
                Some(quoted) => Expr::quote(quoted),
                None => return Err(ReadError::DanglingQuote { span }),
            },
            Token::Identifier(name) => Expr::Name(name),
            Token::Boolean(value) => Expr::Literal(Literal::Boolean(value)),
            Token::Integer(value) => Expr::Literal(Literal::Integer(value)),
            Token::String(value) => Expr::Literal(Literal::String(value)),
        })
    }
}

/// Reads every top-level expression in `source`.
pub fn read(source: &str) -> Result<Vec<Expr>, ReadError> {
    let mut reader = Reader::new(source);
    let mut exprs = vec![];
    while let Some(expr) = reader.read()? {
        exprs.push(expr);
    }
    Ok(exprs)
}

#[cfg(test)]
mod tests {
    use super::{read, ReadError};
    use crate::expr::{Expr, Literal};
    use arbtest::arbtest;
    use assert2::{check, let_assert};

    #[test]
    fn reads_nested_forms() {
        let_assert!(Ok(exprs) = read("(with (x 1 y \"two\") (block x y)) #t"));
        check!(
            exprs
                == vec![
                    Expr::form([
                        Expr::name("with"),
                        Expr::form([
                            Expr::name("x"),
                            Expr::integer(1),
                            Expr::name("y"),
                            Expr::string("two"),
                        ]),
                        Expr::form([Expr::name("block"), Expr::name("x"), Expr::name("y")]),
                    ]),
                    Expr::boolean(true),
                ]
        );
    }

    #[test]
    fn quote_abbreviation() {
        let_assert!(Ok(exprs) = read("'(a b)"));
        check!(
            exprs == vec![Expr::quote(Expr::form([Expr::name("a"), Expr::name("b")]))]
        );
    }

    #[test]
    fn unbalanced_input() {
        let_assert!(Err(ReadError::Unclosed { span }) = read("(a (b)"));
        check!(span == (0..6));
        let_assert!(Err(ReadError::UnexpectedClose { span }) = read("a)"));
        check!(span == (1..2));
        let_assert!(Err(ReadError::DanglingQuote { .. }) = read("'"));
    }

    #[test]
    fn printed_expressions_read_back() {
        arbtest(|u| {
            let expr: Expr = u.arbitrary()?;
            if is_plain(&expr) {
                let printed = expr.to_string();
                check!(read(&printed) == Ok(vec![expr.clone()]), "`{printed}` does not read back");
            }
            Ok(())
        });
    }

    // arbitrary names are not necessarily valid identifiers, and strings are
    // printed with escapes the lexer does not know
    fn is_plain(expr: &Expr) -> bool {
        match expr {
            Expr::Name(name) => read(name).is_ok_and(|exprs| exprs == [Expr::Name(name.clone())]),
            Expr::Literal(Literal::String(s)) => {
                s.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ')
            }
            Expr::Literal(_) => true,
            Expr::Form(items) => items.iter().all(is_plain),
        }
    }
}
