use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {}", n),
            Token::Str(s) => write!(f, "string \"{}\"", s),
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::True => f.write_str("'true'"),
            Token::False => f.write_str("'false'"),
            Token::Null => f.write_str("'null'"),
            Token::Dot => f.write_str("'.'"),
            Token::Comma => f.write_str("','"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::Question => f.write_str("'?'"),
            Token::Colon => f.write_str("':'"),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::Percent => f.write_str("'%'"),
            Token::Bang => f.write_str("'!'"),
            Token::EqEq => f.write_str("'=='"),
            Token::NotEq => f.write_str("'!='"),
            Token::Lt => f.write_str("'<'"),
            Token::Le => f.write_str("'<='"),
            Token::Gt => f.write_str("'>'"),
            Token::Ge => f.write_str("'>='"),
            Token::AndAnd => f.write_str("'&&'"),
            Token::OrOr => f.write_str("'||'"),
            Token::Eof => f.write_str("end of expression"),
        }
    }
}

/// Split an expression into tokens, each paired with its byte offset.
/// The list always ends with [`Token::Eof`].
pub fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        if ch.is_ascii_digit() {
            let mut end = pos;
            let mut seen_dot = false;
            while let Some(&(i, c)) = chars.peek() {
                let fraction_dot = c == '.'
                    && !seen_dot
                    && src[i + 1..].chars().next().is_some_and(|n| n.is_ascii_digit());
                if c.is_ascii_digit() || fraction_dot {
                    seen_dot |= c == '.';
                    end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let text = &src[pos..end];
            let value = text
                .parse::<f64>()
                .map_err(|_| ExprError::InvalidNumber(text.to_string()))?;
            tokens.push((Token::Number(value), pos));
            continue;
        }

        if ch.is_alphabetic() || ch == '_' || ch == '$' {
            let mut end = pos;
            while let Some(&(i, c)) = chars.peek() {
                if c.is_alphanumeric() || c == '_' || c == '$' {
                    end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let token = match &src[pos..end] {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                ident => Token::Ident(ident.to_string()),
            };
            tokens.push((token, pos));
            continue;
        }

        if ch == '"' || ch == '\'' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, 'n')) => text.push('\n'),
                        Some((_, 't')) => text.push('\t'),
                        Some((_, 'r')) => text.push('\r'),
                        Some((_, other)) => text.push(other),
                        None => break,
                    },
                    c if c == ch => {
                        closed = true;
                        break;
                    }
                    c => text.push(c),
                }
            }
            if !closed {
                return Err(ExprError::UnterminatedString(pos));
            }
            tokens.push((Token::Str(text), pos));
            continue;
        }

        chars.next();
        let next = chars.peek().map(|&(_, c)| c);
        let (token, consumed_next) = match (ch, next) {
            ('=', Some('=')) => (Token::EqEq, true),
            ('!', Some('=')) => (Token::NotEq, true),
            ('<', Some('=')) => (Token::Le, true),
            ('>', Some('=')) => (Token::Ge, true),
            ('&', Some('&')) => (Token::AndAnd, true),
            ('|', Some('|')) => (Token::OrOr, true),
            ('!', _) => (Token::Bang, false),
            ('<', _) => (Token::Lt, false),
            ('>', _) => (Token::Gt, false),
            ('.', _) => (Token::Dot, false),
            (',', _) => (Token::Comma, false),
            ('(', _) => (Token::LParen, false),
            (')', _) => (Token::RParen, false),
            ('[', _) => (Token::LBracket, false),
            (']', _) => (Token::RBracket, false),
            ('?', _) => (Token::Question, false),
            (':', _) => (Token::Colon, false),
            ('+', _) => (Token::Plus, false),
            ('-', _) => (Token::Minus, false),
            ('*', _) => (Token::Star, false),
            ('/', _) => (Token::Slash, false),
            ('%', _) => (Token::Percent, false),
            (ch, _) => return Err(ExprError::UnexpectedChar { ch, pos }),
        };
        if consumed_next {
            chars.next();
        }
        tokens.push((token, pos));
    }

    tokens.push((Token::Eof, src.len()));
    Ok(tokens)
}
