//! 词法分析：源码 → Token 序列（带行号）
//!
//! 圆括号/方括号内部的换行会被吞掉，其余换行作为语句分隔符。

use crate::script::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Let,
    If,
    Else,
    Throw,
    Await,
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semi,
    Newline,
    Dot,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Bang,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ScriptError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;
    // 括号嵌套深度（不含花括号）
    let mut depth = 0usize;

    let err = |line: usize, message: String| ScriptError::Syntax { line, message };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                if depth == 0 {
                    tokens.push(Spanned { token: Token::Newline, line });
                }
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' | '\'' | '`' => {
                let quote = c;
                let start_line = line;
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(err(start_line, "unterminated string literal".into()));
                    };
                    i += 1;
                    if ch == quote {
                        break;
                    }
                    if ch == '\n' {
                        line += 1;
                    }
                    if ch == '\\' {
                        let Some(&esc) = chars.get(i) else {
                            return Err(err(line, "unterminated escape sequence".into()));
                        };
                        i += 1;
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            '0' => '\0',
                            other => other,
                        });
                    } else {
                        s.push(ch);
                    }
                }
                tokens.push(Spanned { token: Token::Str(s), line: start_line });
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // 1.foo 不是小数
                    if chars[i] == '.'
                        && !chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())
                    {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| err(line, format!("invalid number literal '{text}'")))?;
                tokens.push(Spanned { token: Token::Number(n), line });
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "let" | "const" | "var" => Token::Let,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "throw" => Token::Throw,
                    "await" => Token::Await,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "undefined" => Token::Null,
                    _ => Token::Ident(word),
                };
                tokens.push(Spanned { token, line });
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => {
                        // === 与 == 等价
                        let w = if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
                        (Token::Eq, w)
                    }
                    ('!', Some('=')) => {
                        let w = if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
                        (Token::Ne, w)
                    }
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('&', Some('&')) => (Token::And, 2),
                    ('|', Some('|')) => (Token::Or, 2),
                    ('=', _) => (Token::Assign, 1),
                    ('!', _) => (Token::Bang, 1),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    ('+', _) => (Token::Plus, 1),
                    ('-', _) => (Token::Minus, 1),
                    ('*', _) => (Token::Star, 1),
                    ('/', _) => (Token::Slash, 1),
                    ('%', _) => (Token::Percent, 1),
                    (',', _) => (Token::Comma, 1),
                    (':', _) => (Token::Colon, 1),
                    (';', _) => (Token::Semi, 1),
                    ('.', _) => (Token::Dot, 1),
                    ('{', _) => (Token::LBrace, 1),
                    ('}', _) => (Token::RBrace, 1),
                    ('(', _) | ('[', _) => {
                        depth += 1;
                        (if c == '(' { Token::LParen } else { Token::LBracket }, 1)
                    }
                    (')', _) | (']', _) => {
                        depth = depth.saturating_sub(1);
                        (if c == ')' { Token::RParen } else { Token::RBracket }, 1)
                    }
                    _ => return Err(err(line, format!("unexpected character '{c}'"))),
                };
                tokens.push(Spanned { token, line });
                i += width;
            }
        }
    }

    tokens.push(Spanned { token: Token::Eof, line });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_tokenize_call() {
        assert_eq!(
            kinds("resolve(1 + 1)"),
            vec![
                Token::Ident("resolve".into()),
                Token::LParen,
                Token::Number(1.0),
                Token::Plus,
                Token::Number(1.0),
                Token::RParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_inside_parens_are_dropped() {
        let tokens = kinds("f(1,\n2)\nx");
        let newlines = tokens.iter().filter(|t| **t == Token::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            kinds(r#"'a\'b' "c\nd""#)[..2],
            [Token::Str("a'b".into()), Token::Str("c\nd".into())]
        );
    }

    #[test]
    fn test_strict_equality_and_keywords() {
        assert_eq!(
            kinds("const a = b === null")[..6],
            [
                Token::Let,
                Token::Ident("a".into()),
                Token::Assign,
                Token::Ident("b".into()),
                Token::Eq,
                Token::Null,
            ]
        );
    }

    #[test]
    fn test_comment_and_line_numbers() {
        let tokens = tokenize("// hello\n\nthrow 'x'").unwrap();
        let throw = tokens.iter().find(|s| s.token == Token::Throw).unwrap();
        assert_eq!(throw.line, 3);
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            tokenize("resolve('abc"),
            Err(ScriptError::Syntax { line: 1, .. })
        ));
    }

    #[test]
    fn test_unexpected_character() {
        assert!(tokenize("a # b").is_err());
    }
}
