// symi -- a compiler and timing engine for microtonal plain-text scores
// Copyright (C) 2021  Fabian Thorand
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use logos::Logos;

// Re-exports
pub use logos::Span;

/// Token kinds of the symi notation language.
///
/// Trivia (whitespace, newlines, comments) is emitted as real tokens and
/// never skipped: the grammar is line sensitive and editors consume the
/// spans for highlighting.
///
/// The numeric literals overlap in prefix (`7`, `7/4`, `7\12`, `7c`);
/// longest match settles most of that. The remaining ambiguity is the
/// spelling/identifier tie-break: a single `A`..`G` letter is a pitch
/// spelling, a letter-only run of two or more characters is an
/// identifier, and anything containing `#` or trailing `+`/`-` marks is
/// a spelling again.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Spaces and tabs, not newlines
    #[regex(r"[ \t]+")]
    Whitespace,
    #[regex(r"\r?\n")]
    Newline,
    /// `//` to the end of the line
    #[regex(r"//[^\r\n]*")]
    Comment,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    /// Chain connector between two pitches
    #[token("@")]
    At,
    /// Macro definitions, ghost lines, base frequency definitions
    #[token("=")]
    Equals,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("<")]
    LAngle,
    #[token(">")]
    RAngle,
    /// Only surfaces when `[` does not open a well-formed duration
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    /// Only surfaces when `{` does not open a well-formed quantize
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    /// Macro names
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", priority = 2)]
    Identifier,
    /// Octave-qualified spelling, e.g. `C#4`, `Bb-1`, `A5+`
    #[regex(r"[A-G](#|b)*-?[0-9]+[+-]*", priority = 4)]
    PitchSpellOctave,
    /// Spelling without octave, e.g. `C`, `F#`, `Bb-`
    ///
    /// Letter-only runs of length >= 2 (like `Bb`) are identifiers, so a
    /// multi-character spelling must contain a `#` or a `+`/`-` mark.
    #[regex(r"[A-G]((#|b)*#(#|b)*[+-]*|(#|b)*[+-]+)?", priority = 3)]
    PitchSpellSimple,
    /// Absolute frequency in Hz, or an EDO step under the shorthand rule
    #[regex(r"-?[0-9]+(\.[0-9]+)?")]
    PitchFrequency,
    /// Ratio relative to the base frequency, also time signatures
    #[regex(r"[0-9]+/[0-9]+")]
    PitchRatio,
    /// `k\n`: k steps of an n-equal division of the octave
    #[regex(r"-?[0-9]+\\[0-9]+")]
    PitchEdo,
    /// Cents above the base frequency, e.g. `100c`, `-50c`
    #[regex(r"-?[0-9]+c")]
    PitchCents,
    /// A run of dots; the length is the rest count
    #[regex(r"\.+")]
    PitchRest,
    /// A bare `-` that is not part of a number or spelling
    #[token("-")]
    PitchSustain,
    /// `[n]` or `[n:m]`, possibly negative
    #[regex(r"\[-?[0-9]+(:[0-9]+)?\]")]
    DurationFraction,
    /// `[,,,]`
    #[regex(r"\[,+\]")]
    DurationCommas,
    /// `{n}` or `{n:m}`
    #[regex(r"\{[0-9]+(:[0-9]+)?\}")]
    Quantize,

    #[error]
    Error,
}

impl TokenKind {
    /// Whitespace and comments; skipped by the parser, newlines are not.
    pub fn is_trivia(self) -> bool {
        matches!(self, TokenKind::Whitespace | TokenKind::Comment)
    }

    /// Pitch literal tokens, the things allowed inside a chain.
    pub fn is_pitch(self) -> bool {
        matches!(
            self,
            TokenKind::PitchSpellOctave
                | TokenKind::PitchSpellSimple
                | TokenKind::PitchFrequency
                | TokenKind::PitchRatio
                | TokenKind::PitchEdo
                | TokenKind::PitchCents
        )
    }

    /// The stable name exposed through the host API.
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::Whitespace => "Whitespace",
            TokenKind::Newline => "Newline",
            TokenKind::Comment => "Comment",
            TokenKind::Comma => "Comma",
            TokenKind::Colon => "Colon",
            TokenKind::Semicolon => "Semicolon",
            TokenKind::At => "At",
            TokenKind::Equals => "Equals",
            TokenKind::LParen => "LParen",
            TokenKind::RParen => "RParen",
            TokenKind::LAngle => "LAngle",
            TokenKind::RAngle => "RAngle",
            TokenKind::LBracket => "LBracket",
            TokenKind::RBracket => "RBracket",
            TokenKind::LBrace => "LBrace",
            TokenKind::RBrace => "RBrace",
            TokenKind::Identifier => "Identifier",
            TokenKind::PitchSpellOctave => "PitchSpellOctave",
            TokenKind::PitchSpellSimple => "PitchSpellSimple",
            TokenKind::PitchFrequency => "PitchFrequency",
            TokenKind::PitchRatio => "PitchRatio",
            TokenKind::PitchEdo => "PitchEdo",
            TokenKind::PitchCents => "PitchCents",
            TokenKind::PitchRest => "PitchRest",
            TokenKind::PitchSustain => "PitchSustain",
            TokenKind::DurationFraction => "DurationFraction",
            TokenKind::DurationCommas => "DurationCommas",
            TokenKind::Quantize => "Quantize",
            // downgraded to identifiers before leaving the lexer
            TokenKind::Error => "Identifier",
        }
    }
}

/// A token with its half-open byte span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Tokenize a source buffer. Never fails: bytes the grammar does not know
/// come back as (unusable) identifiers, which the parser diagnoses.
/// The spans are monotone, non-overlapping, and cover the entire input.
pub fn tokenize(source: &str) -> Vec<Token> {
    TokenKind::lexer(source)
        .spanned()
        .map(|(kind, span)| Token {
            kind: if kind == TokenKind::Error {
                TokenKind::Identifier
            } else {
                kind
            },
            span,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::{expect, Expect};

    fn check(input: &str, output: Expect) {
        let tokens = tokenize(input)
            .into_iter()
            .map(|t| format!("{:?}@{}..{}", t.kind, t.span.start, t.span.end))
            .collect::<Vec<_>>()
            .join(" ");
        output.assert_eq(&tokens);
    }

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .into_iter()
            .filter(|t| !t.kind.is_trivia())
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn coverage_is_exact() {
        let input = "lo = {4}C,D,E,F, // comment\nlo:A,B,C+,D+,\n";
        let tokens = tokenize(input);
        let mut offset = 0;
        for token in &tokens {
            assert_eq!(token.span.start, offset, "gap before {:?}", token);
            offset = token.span.end;
        }
        assert_eq!(offset, input.len());
    }

    #[test]
    fn simple_note_line() {
        check(
            "C4,",
            expect![[r#"PitchSpellOctave@0..2 Comma@2..3"#]],
        );
    }

    #[test]
    fn numeric_literals_disambiguate() {
        assert_eq!(
            kinds("440.0 3/2 7\\12 100c 7"),
            vec![
                TokenKind::PitchFrequency,
                TokenKind::PitchRatio,
                TokenKind::PitchEdo,
                TokenKind::PitchCents,
                TokenKind::PitchFrequency,
            ]
        );
    }

    #[test]
    fn negative_literals() {
        assert_eq!(
            kinds("-50c -3\\12 -5"),
            vec![
                TokenKind::PitchCents,
                TokenKind::PitchEdo,
                TokenKind::PitchFrequency,
            ]
        );
    }

    #[test]
    fn sustain_vs_negative_number() {
        assert_eq!(
            kinds("- -5 -"),
            vec![
                TokenKind::PitchSustain,
                TokenKind::PitchFrequency,
                TokenKind::PitchSustain,
            ]
        );
    }

    #[test]
    fn spelling_vs_identifier_tie_break() {
        // single spelling letter wins over identifier
        assert_eq!(kinds("C"), vec![TokenKind::PitchSpellSimple]);
        // letter-only run of length two is an identifier
        assert_eq!(kinds("Cb"), vec![TokenKind::Identifier]);
        assert_eq!(kinds("lo"), vec![TokenKind::Identifier]);
        // a '#' or a micro mark turns it back into a spelling
        assert_eq!(kinds("C#"), vec![TokenKind::PitchSpellSimple]);
        assert_eq!(kinds("Cb+"), vec![TokenKind::PitchSpellSimple]);
        // non-spelling first letter is always an identifier
        assert_eq!(kinds("x"), vec![TokenKind::Identifier]);
    }

    #[test]
    fn octave_spellings() {
        assert_eq!(kinds("C#4"), vec![TokenKind::PitchSpellOctave]);
        assert_eq!(kinds("Bb-1"), vec![TokenKind::PitchSpellOctave]);
        assert_eq!(kinds("A5+"), vec![TokenKind::PitchSpellOctave]);
        // trailing marks after the octave are the quarter-tone offset
        assert_eq!(kinds("C4++"), vec![TokenKind::PitchSpellOctave]);
    }

    #[test]
    fn rests_and_runs() {
        check(
            "..",
            expect![[r#"PitchRest@0..2"#]],
        );
        check(
            ". .",
            expect![[r#"PitchRest@0..1 Whitespace@1..2 PitchRest@2..3"#]],
        );
    }

    #[test]
    fn durations_and_quantize() {
        assert_eq!(kinds("[1:3]"), vec![TokenKind::DurationFraction]);
        assert_eq!(kinds("[-1:4]"), vec![TokenKind::DurationFraction]);
        assert_eq!(kinds("[2]"), vec![TokenKind::DurationFraction]);
        assert_eq!(kinds("[,,,]"), vec![TokenKind::DurationCommas]);
        assert_eq!(kinds("{4}"), vec![TokenKind::Quantize]);
        assert_eq!(kinds("{3:4}"), vec![TokenKind::Quantize]);
        // malformed brackets surface as raw punctuation for the parser
        assert_eq!(
            kinds("[1:3"),
            vec![
                TokenKind::LBracket,
                TokenKind::PitchFrequency,
                TokenKind::Colon,
                TokenKind::PitchFrequency,
            ]
        );
    }

    #[test]
    fn comments_and_newlines_are_kept() {
        check(
            "// hi\nC,",
            expect![[r#"Comment@0..5 Newline@5..6 PitchSpellSimple@6..7 Comma@7..8"#]],
        );
    }

    #[test]
    fn unknown_bytes_become_identifiers() {
        let tokens = tokenize("C4,?");
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Identifier);
    }

    #[test]
    fn control_headers() {
        assert_eq!(
            kinds("(4/4)(120)<A4=440>"),
            vec![
                TokenKind::LParen,
                TokenKind::PitchRatio,
                TokenKind::RParen,
                TokenKind::LParen,
                TokenKind::PitchFrequency,
                TokenKind::RParen,
                TokenKind::LAngle,
                TokenKind::PitchSpellOctave,
                TokenKind::Equals,
                TokenKind::PitchFrequency,
                TokenKind::RAngle,
            ]
        );
    }
}
