//! Property fuzzing for the tokenizer over generated inputs.

use proptest::prelude::*;
use script_driver::{Token, Tokenizer};

fn all_tokens(text: &str) -> Vec<Token> {
    let mut tok = Tokenizer::new(text);
    let mut out = Vec::new();
    loop {
        let t = tok.next_token().expect("lexable input");
        if t == Token::Eof {
            return out;
        }
        out.push(t);
    }
}

proptest! {
    #[test]
    fn words_round_trip(word in "[a-zA-Z_][a-zA-Z0-9_#$-]{0,20}") {
        prop_assert_eq!(all_tokens(&word), vec![Token::Word(word.clone())]);
    }

    #[test]
    fn quoted_strings_round_trip(text in "[ a-zA-Z0-9,:{}()$#._-]{0,30}") {
        let source = format!("\"{text}\"");
        prop_assert_eq!(all_tokens(&source), vec![Token::Quoted(text.clone())]);
    }

    #[test]
    fn integers_round_trip(n in any::<i32>()) {
        prop_assert_eq!(all_tokens(&n.to_string()), vec![Token::Number(f64::from(n))]);
    }

    #[test]
    fn fractions_round_trip(whole in 0u32..10_000, frac in 1u32..1000) {
        let source = format!("{whole}.{frac:03}");
        let expected = source.parse::<f64>().unwrap();
        prop_assert_eq!(all_tokens(&source), vec![Token::Number(expected)]);
    }

    #[test]
    fn word_sequences_are_preserved(words in prop::collection::vec("[a-z][a-z0-9_]{0,8}", 1..8)) {
        let source = words.join(" ");
        let expected: Vec<Token> = words.iter().map(|w| Token::Word(w.clone())).collect();
        prop_assert_eq!(all_tokens(&source), expected);
    }

    #[test]
    fn whitespace_and_comments_never_change_tokens(
        words in prop::collection::vec("[a-z]{1,6}", 1..5),
        comment in "[ a-z0-9]{0,12}",
    ) {
        let plain = words.join(" ");
        let noisy = format!("  {}\t// {comment}\n", words.join("  \t "));
        prop_assert_eq!(all_tokens(&plain), all_tokens(&noisy));
    }
}
