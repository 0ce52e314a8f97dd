use logos::Logos;

// ── Call-form lexer ─────────────────────────────────────────────────
//
// The surface syntax is uniform call forms: `set(x 5) print(get(x))`.
// Atoms cover identifiers and operator names alike; `-?digits` wins
// over the symbolic atom `-` by longest match, so `-(i 1)` still lexes
// as an atom followed by a group.

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip(r"#[^\n]*", allow_greedy = true))]
pub enum Token {
    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[regex(r"-?[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len()-1].to_string())
    })]
    Text(String),

    // identifiers (underscores and hyphens allowed: `not-equal`, `__p0`)
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*(-[A-Za-z0-9_]+)*", |lex| lex.slice().to_string())]
    Ident(String),

    // operator atoms: `+`, `-`, `*`, `/`, `%`, `=`, `<>`, `<`, `>`
    #[regex(r"[+\-*/%=<>]+", |lex| lex.slice().to_string())]
    Sym(String),
}

#[derive(Debug, thiserror::Error)]
#[error("lex error at byte {position}: unexpected {snippet:?}")]
pub struct LexError {
    pub position: usize,
    pub snippet: String,
}

/// Lex source into tokens with byte spans.
pub fn lex(source: &str) -> Result<Vec<(Token, std::ops::Range<usize>)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push((token, lexer.span())),
            Err(()) => {
                let span = lexer.span();
                return Err(LexError {
                    position: span.start,
                    snippet: source[span].to_string(),
                });
            }
        }
    }

    Ok(tokens)
}
