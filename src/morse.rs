//! International Morse code for outgoing and incoming chat text.
//!
//! Symbols inside a word are separated by one space and words by ` / `.

use thiserror::Error;

const WORD_SEPARATOR: &str = " / ";

const TABLE: &[(char, &str)] = &[
    ('A', ".-"),
    ('B', "-..."),
    ('C', "-.-."),
    ('D', "-.."),
    ('E', "."),
    ('F', "..-."),
    ('G', "--."),
    ('H', "...."),
    ('I', ".."),
    ('J', ".---"),
    ('K', "-.-"),
    ('L', ".-.."),
    ('M', "--"),
    ('N', "-."),
    ('O', "---"),
    ('P', ".--."),
    ('Q', "--.-"),
    ('R', ".-."),
    ('S', "..."),
    ('T', "-"),
    ('U', "..-"),
    ('V', "...-"),
    ('W', ".--"),
    ('X', "-..-"),
    ('Y', "-.--"),
    ('Z', "--.."),
    ('0', "-----"),
    ('1', ".----"),
    ('2', "..---"),
    ('3', "...--"),
    ('4', "....-"),
    ('5', "....."),
    ('6', "-...."),
    ('7', "--..."),
    ('8', "---.."),
    ('9', "----."),
    (',', "--..--"),
    ('.', ".-.-.-"),
    ('?', "..--.."),
    ('\'', ".----."),
    ('-', "-....-"),
    ('/', "-..-."),
    (':', "---..."),
    (';', "-.-.-."),
    ('=', "-...-"),
    ('"', ".-..-."),
    ('@', ".--.-."),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MorseError {
    #[error("unknown morse symbol {0:?}")]
    UnknownSymbol(String),
}

fn encode_char(c: char) -> Option<&'static str> {
    let c = c.to_ascii_uppercase();
    TABLE
        .iter()
        .find(|(plain, _)| *plain == c)
        .map(|(_, code)| *code)
}

fn decode_symbol(symbol: &str) -> Option<char> {
    TABLE
        .iter()
        .find(|(_, code)| *code == symbol)
        .map(|(plain, _)| *plain)
}

/// Encodes `text`. Characters without a Morse symbol are dropped.
pub fn to_morse(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            word.chars()
                .filter_map(encode_char)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(WORD_SEPARATOR)
}

/// Decodes Morse back to uppercase text with single spaces between words.
pub fn from_morse(code: &str) -> Result<String, MorseError> {
    let mut words = Vec::new();
    for word in code.split('/') {
        let decoded = word
            .split_whitespace()
            .map(|symbol| {
                decode_symbol(symbol).ok_or_else(|| MorseError::UnknownSymbol(symbol.to_string()))
            })
            .collect::<Result<String, _>>()?;
        if !decoded.is_empty() {
            words.push(decoded);
        }
    }
    Ok(words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_sos() {
        assert_eq!(to_morse("SOS"), "... --- ...");
        assert_eq!(to_morse("sos"), "... --- ...");
    }

    #[test]
    fn separates_words_and_collapses_spaces() {
        assert_eq!(to_morse("  hi   there "), ".... .. / - .... . .-. .");
    }

    #[test]
    fn unsupported_characters_are_dropped() {
        assert_eq!(to_morse("a#b"), ".- -...");
        assert_eq!(to_morse("### a"), ".-");
        assert_eq!(to_morse(""), "");
    }

    #[test]
    fn punctuation_round_trips() {
        let text = "Hello, world? it's 10:30; a=b \"ok\" me@host a/b.";
        assert_eq!(
            from_morse(&to_morse(text)).expect("decode"),
            "HELLO, WORLD? IT'S 10:30; A=B \"OK\" ME@HOST A/B."
        );
    }

    #[test]
    fn slash_symbol_is_not_a_word_break() {
        assert_eq!(to_morse("a/b"), ".- -..-. -...");
        assert_eq!(from_morse(".- -..-. -...").expect("decode"), "A/B");
    }

    #[test]
    fn unknown_symbol_is_an_error() {
        assert_eq!(
            from_morse("... ......."),
            Err(MorseError::UnknownSymbol(".......".to_string()))
        );
    }

    #[test]
    fn decodes_loose_spacing() {
        assert_eq!(from_morse(" ...   ---  ... /  .- ").expect("decode"), "SOS A");
    }
}
