use super::*;

/// One lexical unit of the command language. Tokens are produced lazily and
/// never mutated after being read.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Word(String),
    Quoted(String),
    Number(f64),
    Punct(char),
    Eol,
    Eof,
}

impl Token {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Word(w) => format!("word `{w}`"),
            Self::Quoted(s) => format!("string \"{s}\""),
            Self::Number(n) => format!("number {}", number_text(*n)),
            Self::Punct(c) => format!("`{c}`"),
            Self::Eol => "end of line".into(),
            Self::Eof => "end of input".into(),
        }
    }
}

/// Renders a number the way the script language writes one: integral values
/// without a fractional part.
pub(crate) fn number_text(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || matches!(c, '$' | '#' | '_' | '\\' | '-')
}

fn is_word_part(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '$' | '#' | '_' | '\\' | '-' | '.')
}

/// Lazy tokenizer over an in-memory character source.
///
/// `$`, `#`, `_` and `\` are word constituents so identifiers like `$name`,
/// `test-id#3` or `\$literal` come out as single words. A `-` starts a number
/// when a digit follows and a word (`--onfail`) otherwise. Newlines are plain
/// whitespace unless `set_eol_significant(true)` is active (block scanning).
pub struct Tokenizer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    pushed: Option<(Token, u32)>,
    eol_significant: bool,
}

impl Tokenizer {
    pub fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            pushed: None,
            eol_significant: false,
        }
    }

    /// Line number of the most recently read (or pushed back) token.
    pub fn line(&self) -> u32 {
        match &self.pushed {
            Some((_, line)) => *line,
            None => self.line,
        }
    }

    pub fn set_eol_significant(&mut self, on: bool) {
        self.eol_significant = on;
    }

    /// Returns `token` on the next `next_token` call. At most one token deep.
    pub fn push_back(&mut self, token: Token) {
        self.pushed = Some((token, self.line));
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    pub fn next_token(&mut self) -> Result<Token> {
        if let Some((token, _)) = self.pushed.take() {
            return Ok(token);
        }
        loop {
            let Some(c) = self.peek() else {
                return Ok(Token::Eof);
            };
            match c {
                ' ' | '\t' | '\r' => self.pos += 1,
                '\n' => {
                    self.pos += 1;
                    self.line += 1;
                    if self.eol_significant {
                        return Ok(Token::Eol);
                    }
                }
                '/' if self.peek_at(1) == Some('/') => self.skip_line_comment(),
                '/' if self.peek_at(1) == Some('*') => self.skip_block_comment()?,
                '"' => return self.scan_quoted(),
                c if c.is_ascii_digit() => return self.scan_number(),
                '-' | '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                    return self.scan_number();
                }
                c if is_word_start(c) => return Ok(self.scan_word()),
                other => {
                    self.pos += 1;
                    return Ok(Token::Punct(other));
                }
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<()> {
        let start_line = self.line;
        self.pos += 2;
        loop {
            match self.peek() {
                None => {
                    return Err(Error::Lex(format!(
                        "unterminated block comment starting at line {start_line}"
                    )));
                }
                Some('*') if self.peek_at(1) == Some('/') => {
                    self.pos += 2;
                    return Ok(());
                }
                Some('\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn scan_word(&mut self) -> Token {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if !is_word_part(c) {
                break;
            }
            word.push(c);
            self.pos += 1;
        }
        Token::Word(word)
    }

    fn scan_number(&mut self) -> Result<Token> {
        let start_line = self.line;
        let mut text = String::new();
        if self.peek() == Some('-') {
            text.push('-');
            self.pos += 1;
        }
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.pos += 1;
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                text.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        let value = text
            .parse::<f64>()
            .map_err(|_| Error::Lex(format!("malformed number `{text}` at line {start_line}")))?;
        Ok(Token::Number(value))
    }

    fn scan_quoted(&mut self) -> Result<Token> {
        let start_line = self.line;
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(Error::Lex(format!(
                        "unterminated string literal at line {start_line}"
                    )));
                }
                Some('"') => {
                    self.pos += 1;
                    return Ok(Token::Quoted(text));
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some(c) => text.push(c),
                        None => {
                            return Err(Error::Lex(format!(
                                "unterminated string literal at line {start_line}"
                            )));
                        }
                    }
                    self.pos += 1;
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tokens(text: &str) -> Result<Vec<Token>> {
        let mut tok = Tokenizer::new(text);
        let mut out = Vec::new();
        loop {
            let t = tok.next_token()?;
            if t == Token::Eof {
                return Ok(out);
            }
            out.push(t);
        }
    }

    #[test]
    fn words_keep_marker_characters() -> Result<()> {
        let tokens = all_tokens("field test-id#3 $name \\$name form.field --onfail")?;
        assert_eq!(
            tokens,
            vec![
                Token::Word("field".into()),
                Token::Word("test-id#3".into()),
                Token::Word("$name".into()),
                Token::Word("\\$name".into()),
                Token::Word("form.field".into()),
                Token::Word("--onfail".into()),
            ]
        );
        Ok(())
    }

    #[test]
    fn numbers_and_punctuation() -> Result<()> {
        let tokens = all_tokens("size 10:20,30 at -1,0.5")?;
        assert_eq!(
            tokens,
            vec![
                Token::Word("size".into()),
                Token::Number(10.0),
                Token::Punct(':'),
                Token::Number(20.0),
                Token::Punct(','),
                Token::Number(30.0),
                Token::Word("at".into()),
                Token::Number(-1.0),
                Token::Punct(','),
                Token::Number(0.5),
            ]
        );
        Ok(())
    }

    #[test]
    fn comments_are_stripped() -> Result<()> {
        let tokens = all_tokens("click // trailing\n/* block\ncomment */ clear")?;
        assert_eq!(
            tokens,
            vec![Token::Word("click".into()), Token::Word("clear".into())]
        );
        Ok(())
    }

    #[test]
    fn quoted_strings_unescape() -> Result<()> {
        let tokens = all_tokens(r#"echo "say \"hi\"\n""#)?;
        assert_eq!(
            tokens,
            vec![
                Token::Word("echo".into()),
                Token::Quoted("say \"hi\"\n".into()),
            ]
        );
        Ok(())
    }

    #[test]
    fn unterminated_string_is_a_lex_error() {
        let mut tok = Tokenizer::new("echo \"oops");
        assert_eq!(tok.next_token(), Ok(Token::Word("echo".into())));
        assert!(matches!(tok.next_token(), Err(Error::Lex(_))));
    }

    #[test]
    fn unterminated_block_comment_is_a_lex_error() {
        let mut tok = Tokenizer::new("/* never closed");
        assert!(matches!(tok.next_token(), Err(Error::Lex(_))));
    }

    #[test]
    fn eol_only_significant_when_enabled() -> Result<()> {
        let mut tok = Tokenizer::new("a\nb");
        assert_eq!(tok.next_token()?, Token::Word("a".into()));
        assert_eq!(tok.next_token()?, Token::Word("b".into()));

        let mut tok = Tokenizer::new("a\nb");
        tok.set_eol_significant(true);
        assert_eq!(tok.next_token()?, Token::Word("a".into()));
        assert_eq!(tok.next_token()?, Token::Eol);
        assert_eq!(tok.next_token()?, Token::Word("b".into()));
        Ok(())
    }

    #[test]
    fn push_back_replays_one_token() -> Result<()> {
        let mut tok = Tokenizer::new("alpha beta");
        let first = tok.next_token()?;
        tok.push_back(first.clone());
        assert_eq!(tok.next_token()?, first);
        assert_eq!(tok.next_token()?, Token::Word("beta".into()));
        Ok(())
    }

    #[test]
    fn line_numbers_track_newlines() -> Result<()> {
        let mut tok = Tokenizer::new("a\n\nb");
        tok.next_token()?;
        assert_eq!(tok.line(), 1);
        tok.next_token()?;
        assert_eq!(tok.line(), 3);
        Ok(())
    }

    #[test]
    fn number_text_drops_integral_fraction() {
        assert_eq!(number_text(5.0), "5");
        assert_eq!(number_text(-3.0), "-3");
        assert_eq!(number_text(2.5), "2.5");
    }
}
