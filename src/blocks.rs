use super::*;
use crate::tokenizer::number_text;

// Joins block tokens the way the language spells arguments back out: a fixed
// separator, with `,` and `:` overriding exactly the next join.
struct Joiner {
    sep: char,
    join: char,
    args: Option<String>,
}

impl Joiner {
    fn new(sep: char) -> Self {
        Self {
            sep,
            join: sep,
            args: None,
        }
    }

    fn push(&mut self, piece: &str) {
        self.args = Some(match self.args.take() {
            None => piece.to_string(),
            Some(joined) => format!("{joined}{}{piece}", self.join),
        });
        self.join = self.sep;
    }

    fn transient(&mut self, join: char) {
        self.join = join;
    }

    fn finish(self) -> String {
        self.args.unwrap_or_default()
    }
}

fn escape_quoted(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Reads a `{ ... }` run and joins its tokens into one string.
///
/// Returns `Ok(None)` when the next token is not `{` (the token is pushed
/// back) — "no block" is distinct from an empty block. Quoted strings are
/// re-escaped so the result can be tokenized again; nested braces are kept
/// verbatim with depth tracking.
pub(crate) fn read_block(
    tok: &mut Tokenizer,
    sep: char,
    quote_words: bool,
) -> Result<Option<String>> {
    match tok.next_token()? {
        Token::Punct('{') => {}
        other => {
            tok.push_back(other);
            return Ok(None);
        }
    }
    tok.set_eol_significant(true);
    let result = scan_block(tok, sep, quote_words);
    tok.set_eol_significant(false);
    result.map(Some)
}

fn scan_block(tok: &mut Tokenizer, sep: char, quote_words: bool) -> Result<String> {
    let mut depth = 1u32;
    let mut joiner = Joiner::new(sep);
    loop {
        let line = tok.line();
        match tok.next_token()? {
            Token::Punct('{') => {
                depth += 1;
                joiner.push("{");
            }
            Token::Punct('}') => {
                depth -= 1;
                if depth == 0 {
                    return Ok(joiner.finish());
                }
                joiner.push("}");
            }
            Token::Word(w) => {
                if quote_words {
                    joiner.push(&format!("\"{w}\""));
                } else {
                    joiner.push(&w);
                }
            }
            Token::Quoted(s) => joiner.push(&format!("\"{}\"", escape_quoted(&s))),
            Token::Number(n) => joiner.push(&number_text(n)),
            Token::Eol => joiner.push("\n"),
            Token::Punct(',') => joiner.transient(','),
            Token::Punct(':') => joiner.transient(':'),
            Token::Punct('*') => joiner.push("*"),
            Token::Eof => {
                return Err(Error::Syntax(format!("unterminated block at line {line}")));
            }
            other => {
                return Err(Error::Syntax(format!(
                    "unexpected {} in block at line {line}",
                    other.describe()
                )));
            }
        }
    }
}

/// Same scan as [`read_block`] but yields discrete arguments with quotes
/// stripped. Returns an empty list when no block follows.
pub(crate) fn read_args_list(tok: &mut Tokenizer) -> Result<Vec<String>> {
    match tok.next_token()? {
        Token::Punct('{') => {}
        other => {
            tok.push_back(other);
            return Ok(Vec::new());
        }
    }
    tok.set_eol_significant(true);
    let result = scan_args(tok);
    tok.set_eol_significant(false);
    result
}

fn scan_args(tok: &mut Tokenizer) -> Result<Vec<String>> {
    let mut depth = 1u32;
    let mut args = Vec::new();
    loop {
        let line = tok.line();
        match tok.next_token()? {
            Token::Punct('{') => {
                depth += 1;
                args.push("{".into());
            }
            Token::Punct('}') => {
                depth -= 1;
                if depth == 0 {
                    return Ok(args);
                }
                args.push("}".into());
            }
            Token::Word(w) => args.push(w),
            Token::Quoted(s) => args.push(s),
            Token::Number(n) => args.push(number_text(n)),
            Token::Punct('*') => args.push("*".into()),
            Token::Eol | Token::Punct(',') | Token::Punct(':') => {}
            Token::Eof => {
                return Err(Error::Syntax(format!("unterminated block at line {line}")));
            }
            other => {
                return Err(Error::Syntax(format!(
                    "unexpected {} in block at line {line}",
                    other.describe()
                )));
            }
        }
    }
}

/// Reads a `( name, name, ... )` parameter list. Returns `Ok(None)` when the
/// next token is not `(`.
pub(crate) fn read_params(tok: &mut Tokenizer) -> Result<Option<Vec<String>>> {
    match tok.next_token()? {
        Token::Punct('(') => {}
        other => {
            tok.push_back(other);
            return Ok(None);
        }
    }
    let mut names = Vec::new();
    loop {
        let line = tok.line();
        match tok.next_token()? {
            Token::Word(name) => names.push(name),
            Token::Punct(',') => {}
            Token::Punct(')') => return Ok(Some(names)),
            other => {
                return Err(Error::Syntax(format!(
                    "expected parameter name, found {} at line {line}",
                    other.describe()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_block_is_distinct_from_empty_block() -> Result<()> {
        let mut tok = Tokenizer::new("next");
        assert_eq!(read_block(&mut tok, ' ', false)?, None);
        assert_eq!(tok.next_token()?, Token::Word("next".into()));

        let mut tok = Tokenizer::new("{}");
        assert_eq!(read_block(&mut tok, ' ', false)?, Some(String::new()));
        Ok(())
    }

    #[test]
    fn block_joins_with_separator() -> Result<()> {
        let mut tok = Tokenizer::new("{ click field name }");
        assert_eq!(
            read_block(&mut tok, ' ', false)?,
            Some("click field name".into())
        );
        Ok(())
    }

    #[test]
    fn transient_separators_apply_to_next_join_only() -> Result<()> {
        let mut tok = Tokenizer::new("{ a , b c : d }");
        assert_eq!(read_block(&mut tok, ' ', false)?, Some("a,b c:d".into()));
        Ok(())
    }

    #[test]
    fn nested_braces_are_preserved() -> Result<()> {
        let mut tok = Tokenizer::new("{ while { click } }");
        assert_eq!(
            read_block(&mut tok, ' ', false)?,
            Some("while { click }".into())
        );
        Ok(())
    }

    #[test]
    fn quoted_strings_are_reescaped() -> Result<()> {
        let mut tok = Tokenizer::new(r#"{ set "a \"b\"" }"#);
        assert_eq!(
            read_block(&mut tok, ' ', false)?,
            Some(r#"set "a \"b\"""#.into())
        );
        Ok(())
    }

    #[test]
    fn quote_words_mode_wraps_bare_words() -> Result<()> {
        let mut tok = Tokenizer::new("{ alpha 2 \"beta\" }");
        assert_eq!(
            read_block(&mut tok, ',', true)?,
            Some("\"alpha\",2,\"beta\"".into())
        );
        Ok(())
    }

    #[test]
    fn unterminated_block_is_a_syntax_error() {
        let mut tok = Tokenizer::new("{ a b");
        assert!(matches!(
            read_block(&mut tok, ' ', false),
            Err(Error::Syntax(_))
        ));
    }

    #[test]
    fn args_list_strips_quotes() -> Result<()> {
        let mut tok = Tokenizer::new("{ one \"two words\" 3 }");
        assert_eq!(
            read_args_list(&mut tok)?,
            vec!["one".to_string(), "two words".to_string(), "3".to_string()]
        );
        Ok(())
    }

    #[test]
    fn params_list_reads_names() -> Result<()> {
        let mut tok = Tokenizer::new("(a, b, c)");
        assert_eq!(
            read_params(&mut tok)?,
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );

        let mut tok = Tokenizer::new("{body}");
        assert_eq!(read_params(&mut tok)?, None);
        Ok(())
    }
}
