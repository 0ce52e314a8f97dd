use crate::ast::Node;
use crate::lexer::{self, LexError, Token};

// ── Call-form parser ────────────────────────────────────────────────
//
// Grammar, whitespace-separated:
//
//   program  := element*
//   element  := atom '(' element* ')'     (call form)
//             | '(' element* ')'          (anonymous group)
//             | atom | number | string    (leaves)

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("unbalanced parenthesis at token {position}")]
    Unbalanced { position: usize },
    #[error("unexpected closing parenthesis at token {position}")]
    UnexpectedClose { position: usize },
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type Result<T> = std::result::Result<T, ParseError>;

/// Parse a full source string into the root Group node.
pub fn parse(source: &str) -> Result<Node> {
    let tokens = lexer::lex(source)?
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    Parser { tokens, pos: 0 }.parse_root()
}

impl Parser {
    fn parse_root(&mut self) -> Result<Node> {
        let children = self.parse_elements(false)?;
        Ok(Node::group(children))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Parse elements until a closing parenthesis (when `nested`) or
    /// end of input.
    fn parse_elements(&mut self, nested: bool) -> Result<Vec<Node>> {
        let mut elements = Vec::new();
        loop {
            match self.peek() {
                None => {
                    if nested {
                        return Err(ParseError::Unbalanced { position: self.pos });
                    }
                    return Ok(elements);
                }
                Some(Token::RParen) => {
                    if nested {
                        self.advance();
                        return Ok(elements);
                    }
                    return Err(ParseError::UnexpectedClose { position: self.pos });
                }
                _ => elements.push(self.parse_element()?),
            }
        }
    }

    fn parse_element(&mut self) -> Result<Node> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Node::numeric(crate::word::fmt_number(n))),
            Some(Token::Text(s)) => Ok(Node::string(s)),
            Some(Token::Ident(name)) | Some(Token::Sym(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let children = self.parse_elements(true)?;
                    Ok(Node::call(name, children))
                } else {
                    Ok(Node::atom(name))
                }
            }
            Some(Token::LParen) => {
                let children = self.parse_elements(true)?;
                Ok(Node::group(children))
            }
            Some(Token::RParen) => Err(ParseError::UnexpectedClose { position: self.pos - 1 }),
            None => Err(ParseError::Unbalanced { position: self.pos }),
        }
    }
}
