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

//! Error-tolerant parser for the symi notation language.
//!
//! The parser never aborts: unexpected tokens produce a diagnostic and
//! are skipped until a synchronizing token (`,`, `;`, newline, closing
//! bracket). Blank lines and comments separate statements.

use crate::{
    ast::{
        Atom, BaseFreqItem, Chain, Group, Line, MacroDef, Node, Pitch, Root, SeqItem, Sequence,
        Spell, Voice,
    },
    diag::Diagnostic,
    lexer::{self, Span, Token, TokenKind},
};
use symi_core::rational::Rational;


#[derive(Debug)]
pub struct ParseResult {
    pub tokens: Vec<Token>,
    pub root: Node<Root>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn parse(source: &str) -> ParseResult {
    let tokens = lexer::tokenize(source);
    let mut parser = Parser {
        source,
        tokens: &tokens,
        pos: 0,
        diagnostics: Vec::new(),
    };
    let root = parser.parse_root();
    ParseResult {
        root,
        diagnostics: parser.diagnostics,
        tokens,
    }
}

/// Which line a ghost line would attach to.
enum GhostTarget {
    /// Nothing to attach to yet: layered at the song origin.
    Origin,
    /// Extra body voice of the macro definition at this line index.
    Def(usize),
    /// Layered over the preceding play line at resolve time.
    Play,
}

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Parser<'a> {
    // ==================== token stream helpers ====================

    /// Index of the next non-trivia token, newlines included.
    fn peek_index(&self) -> Option<usize> {
        self.tokens[self.pos..]
            .iter()
            .position(|t| !t.kind.is_trivia())
            .map(|off| self.pos + off)
    }

    fn peek(&self) -> Option<&'a Token> {
        self.peek_index().map(|i| &self.tokens[i])
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    /// Kind of the n-th upcoming non-trivia token.
    fn nth_kind(&self, n: usize) -> Option<TokenKind> {
        self.tokens[self.pos..]
            .iter()
            .filter(|t| !t.kind.is_trivia())
            .nth(n)
            .map(|t| t.kind)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let index = self.peek_index()?;
        self.pos = index + 1;
        Some(&self.tokens[index])
    }

    fn eat(&mut self, kind: TokenKind) -> Option<&'a Token> {
        if self.peek_kind() == Some(kind) {
            self.bump()
        } else {
            None
        }
    }

    fn text(&self, token: &Token) -> &'a str {
        &self.source[token.span.clone()]
    }

    fn eof_span(&self) -> Span {
        self.source.len()..self.source.len()
    }

    fn here(&self) -> Span {
        self.peek()
            .map(|t| t.span.clone())
            .unwrap_or_else(|| self.eof_span())
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::error(message, span));
    }

    fn warning(&mut self, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::warning(message, span));
    }

    // ==================== line structure ====================

    fn parse_root(&mut self) -> Node<Root> {
        let mut lines: Vec<Node<Line>> = Vec::new();
        let mut ghost_target = GhostTarget::Origin;

        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::Newline => {
                    self.bump();
                }
                TokenKind::Equals => {
                    let start = token.span.start;
                    self.bump();
                    let seq = self.parse_sequence();
                    let span = start..self.line_end_offset(start);
                    match ghost_target {
                        GhostTarget::Def(index) => {
                            if let Line::Def(def) = &mut lines[index].data {
                                def.voices.push(seq.data);
                                lines[index].span.end = span.end;
                            }
                        }
                        GhostTarget::Origin | GhostTarget::Play => {
                            lines.push(Node::new(span, Line::Ghost(seq.data)));
                        }
                    }
                }
                TokenKind::Identifier if self.at_def_marker() => {
                    let line = self.parse_def();
                    lines.push(line);
                    ghost_target = GhostTarget::Def(lines.len() - 1);
                }
                _ => {
                    let start = token.span.start;
                    let seq = self.parse_sequence();
                    let span = start..self.line_end_offset(start);
                    lines.push(Node::new(span, Line::Play(seq.data)));
                    ghost_target = GhostTarget::Play;
                }
            }
        }

        Node::new(0..self.source.len(), Root { lines })
    }

    /// End offset of the line that was just consumed.
    fn line_end_offset(&self, start: usize) -> usize {
        self.tokens[..self.pos]
            .last()
            .map(|t| t.span.end)
            .unwrap_or(start)
            .max(start)
    }

    /// `name =` or `name() =` ahead, before the end of the line.
    fn at_def_marker(&self) -> bool {
        match (self.nth_kind(0), self.nth_kind(1)) {
            (Some(TokenKind::Identifier), Some(TokenKind::Equals)) => true,
            (Some(TokenKind::Identifier), Some(TokenKind::LParen)) => {
                self.nth_kind(2) == Some(TokenKind::RParen)
                    && self.nth_kind(3) == Some(TokenKind::Equals)
            }
            _ => false,
        }
    }

    fn parse_def(&mut self) -> Node<Line> {
        let name_token = self.bump().expect("checked by at_def_marker");
        let name = Node::new(name_token.span.clone(), self.text(name_token).to_string());
        let relative = if self.peek_kind() == Some(TokenKind::LParen) {
            self.bump();
            self.bump(); // the checked `)`
            true
        } else {
            false
        };
        self.bump(); // the checked `=`
        let body = self.parse_sequence();
        let span = name.span.start..self.line_end_offset(name.span.start);
        Node::new(
            span,
            Line::Def(MacroDef {
                name,
                relative,
                voices: vec![body.data],
            }),
        )
    }

    // ==================== sequences ====================

    /// Parse items until the end of the line. The newline is consumed.
    fn parse_sequence(&mut self) -> Node<Sequence> {
        let start = self.here().start;
        let mut items: Vec<Node<SeqItem>> = Vec::new();
        let mut group: Option<GroupBuilder> = None;

        loop {
            let token = match self.peek() {
                None => break,
                Some(t) => t,
            };
            let span = token.span.clone();
            match token.kind {
                TokenKind::Newline => {
                    self.bump();
                    break;
                }
                TokenKind::Comma => {
                    self.bump();
                    self.close_group(&mut group, &mut items);
                    items.push(Node::new(span, SeqItem::Advance));
                }
                TokenKind::Colon | TokenKind::Semicolon => {
                    self.bump();
                    group
                        .get_or_insert_with(|| GroupBuilder::new(span.start))
                        .next_voice();
                }
                TokenKind::PitchRest => {
                    let count = self.text(token).len() as u32;
                    self.bump();
                    if self.reject_chain_tail(&span) {
                        continue;
                    }
                    self.push_atom(&mut group, Node::new(span, Atom::Rest(count)));
                }
                TokenKind::PitchSustain => {
                    self.bump();
                    if self.reject_chain_tail(&span) {
                        continue;
                    }
                    self.push_atom(&mut group, Node::new(span, Atom::Sustain));
                }
                kind if kind.is_pitch() => {
                    if let Some(atom) = self.parse_chain_atom() {
                        self.push_atom(&mut group, atom);
                    }
                }
                TokenKind::Identifier => {
                    let name = self.text(token).to_string();
                    self.bump();
                    if self.peek_kind() == Some(TokenKind::At) {
                        self.error(
                            "a chain cannot start with a macro invocation",
                            span.start..self.here().end,
                        );
                        self.skip_chain_tail();
                    }
                    self.push_atom(&mut group, Node::new(span, Atom::Call(name)));
                }
                TokenKind::DurationFraction => {
                    self.bump();
                    if let Some(scale) = self.duration_fraction(token) {
                        items.push(Node::new(span, SeqItem::Scale(scale)));
                    }
                }
                TokenKind::DurationCommas => {
                    self.bump();
                    let count = self.text(token).matches(',').count() as u32;
                    items.push(Node::new(span, SeqItem::Extend(count)));
                }
                TokenKind::Quantize => {
                    self.bump();
                    if let Some(item) = self.quantize(token) {
                        items.push(Node::new(span, item));
                    }
                }
                TokenKind::LParen => {
                    self.close_group(&mut group, &mut items);
                    if let Some(item) = self.parse_paren_header() {
                        items.push(item);
                    }
                }
                TokenKind::LAngle => {
                    self.close_group(&mut group, &mut items);
                    if let Some(item) = self.parse_base_freq() {
                        items.push(item);
                    }
                }
                TokenKind::At => {
                    self.bump();
                    self.error("expected a pitch before '@'", span);
                }
                TokenKind::LBracket => {
                    // error-repaired as a neutral duration
                    self.bump();
                    self.error("malformed duration, expected `[n:m]` or `[,,,]`", span.clone());
                    items.push(Node::new(span, SeqItem::Scale(Rational::one())));
                }
                _ => {
                    self.bump();
                    self.error(
                        format!("unexpected token {:?}", self.text(token)),
                        span,
                    );
                }
            }
        }

        // A group left open at the end of the line still resolves, it
        // just does not advance the clock (that is the comma's job).
        if let Some(builder) = group.take() {
            items.push(Node::new(builder.span.clone(), SeqItem::Group(builder.finish())));
        }

        let end = self.line_end_offset(start);
        Node::new(start..end, Sequence { items })
    }

    fn push_atom(&mut self, group: &mut Option<GroupBuilder>, atom: Node<Atom>) {
        group
            .get_or_insert_with(|| GroupBuilder::new(atom.span.start))
            .push(atom);
    }

    fn close_group(&mut self, group: &mut Option<GroupBuilder>, items: &mut Vec<Node<SeqItem>>) {
        if let Some(builder) = group.take() {
            items.push(Node::new(
                builder.span.clone(),
                SeqItem::Group(builder.finish()),
            ));
        }
    }

    // ==================== atoms ====================

    /// A pitch, optionally chained with `@` to further pitches.
    fn parse_chain_atom(&mut self) -> Option<Node<Atom>> {
        let first_token = self.bump().expect("caller checked for a pitch token");
        let mut pitches = Vec::new();
        if let Some(pitch) = self.pitch_literal(first_token) {
            pitches.push(pitch);
        }
        let start = first_token.span.start;
        let mut end = first_token.span.end;

        while self.eat(TokenKind::At).is_some() {
            match self.peek() {
                Some(next) if next.kind.is_pitch() => {
                    self.bump();
                    end = next.span.end;
                    if let Some(pitch) = self.pitch_literal(next) {
                        pitches.push(pitch);
                    }
                }
                Some(next)
                    if matches!(next.kind, TokenKind::PitchRest | TokenKind::PitchSustain) =>
                {
                    let span = next.span.clone();
                    self.bump();
                    end = span.end;
                    self.error("rest/sustain cannot be used inside a pitch chain", span);
                }
                _ => {
                    self.error("expected a pitch after '@'", start..end);
                    break;
                }
            }
        }

        if pitches.is_empty() {
            return None;
        }
        Some(Node::new(start..end, Atom::Chain(Chain { pitches })))
    }

    /// Diagnose and drop a chain tail behind a rest or sustain.
    fn reject_chain_tail(&mut self, head: &Span) -> bool {
        if self.peek_kind() == Some(TokenKind::At) {
            let end = self.here().end;
            self.error(
                "rest/sustain cannot be used inside a pitch chain",
                head.start..end,
            );
            self.skip_chain_tail();
            true
        } else {
            false
        }
    }

    /// Consume a dangling `@ pitch` tail after an unsupported chain head.
    fn skip_chain_tail(&mut self) {
        while self.eat(TokenKind::At).is_some() {
            if self.peek().map_or(false, |t| {
                t.kind.is_pitch()
                    || matches!(t.kind, TokenKind::PitchRest | TokenKind::PitchSustain)
            }) {
                self.bump();
            }
        }
    }

    fn pitch_literal(&mut self, token: &Token) -> Option<Node<Pitch>> {
        let text = self.text(token);
        let span = token.span.clone();
        let pitch = match token.kind {
            TokenKind::PitchSpellOctave => self.spell(text, span.clone(), true),
            TokenKind::PitchSpellSimple => self.spell(text, span.clone(), false),
            TokenKind::PitchFrequency => {
                if text.contains('.') {
                    text.parse::<f64>().ok().map(Pitch::Frequency)
                } else if let Ok(int) = text.parse::<i64>() {
                    Some(Pitch::Integer(int))
                } else {
                    text.parse::<f64>().ok().map(Pitch::Frequency)
                }
            }
            TokenKind::PitchRatio => {
                let mut parts = text.splitn(2, '/');
                let num = parts.next()?.parse::<i64>().ok()?;
                let denom = parts.next()?.parse::<i64>().ok()?;
                if denom == 0 || num == 0 {
                    self.warning("ratio terms must be positive", span.clone());
                    None
                } else {
                    Some(Pitch::Ratio(num, denom))
                }
            }
            TokenKind::PitchEdo => {
                let mut parts = text.splitn(2, '\\');
                let step = parts.next()?.parse::<i64>().ok()?;
                let divisions = parts.next()?.parse::<i64>().ok()?;
                if divisions == 0 {
                    self.warning("EDO divisions must be positive", span.clone());
                    None
                } else {
                    Some(Pitch::Edo { step, divisions })
                }
            }
            TokenKind::PitchCents => text[..text.len() - 1].parse::<i64>().ok().map(Pitch::Cents),
            _ => None,
        };
        match pitch {
            Some(p) => Some(Node::new(span, p)),
            None => {
                self.warning(format!("malformed pitch literal {:?}", text), span);
                None
            }
        }
    }

    fn spell(&mut self, text: &str, span: Span, with_octave: bool) -> Option<Pitch> {
        let mut chars = text.chars().peekable();
        let letter_semitone = match chars.next()? {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };
        let mut accidentals = 0;
        while let Some(&ch) = chars.peek() {
            match ch {
                '#' => accidentals += 1,
                'b' => accidentals -= 1,
                _ => break,
            }
            chars.next();
        }
        let octave = if with_octave {
            let mut digits = String::new();
            if chars.peek() == Some(&'-') {
                digits.push('-');
                chars.next();
            }
            while let Some(&ch) = chars.peek() {
                if ch.is_ascii_digit() {
                    digits.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            match digits.parse::<i32>() {
                Ok(o) => Some(o),
                Err(_) => {
                    self.warning("malformed octave number", span);
                    return None;
                }
            }
        } else {
            None
        };
        let mut micro = 0;
        for ch in chars {
            match ch {
                '+' => micro += 1,
                '-' => micro -= 1,
                _ => return None,
            }
        }
        Some(Pitch::Spell(Spell {
            letter_semitone,
            accidentals,
            octave,
            micro,
        }))
    }

    // ==================== control headers ====================

    /// `(n/m)`, `(bpm)` or `([n:m]=bpm)`.
    fn parse_paren_header(&mut self) -> Option<Node<SeqItem>> {
        let lparen = self.bump().expect("caller checked for '('");
        let start = lparen.span.start;
        match self.peek_kind() {
            Some(TokenKind::PitchRatio) => {
                let token = self.bump().unwrap();
                let text = self.text(token);
                let mut parts = text.splitn(2, '/');
                let num = parts.next().and_then(|s| s.parse::<u32>().ok());
                let denom = parts.next().and_then(|s| s.parse::<u32>().ok());
                let item = match (num, denom) {
                    (Some(n), Some(d)) if n > 0 && d > 0 => Some(SeqItem::TimeSig(n, d)),
                    _ => {
                        self.error(
                            format!("invalid time signature {:?}", text),
                            token.span.clone(),
                        );
                        None
                    }
                };
                let end = self.expect_closing(TokenKind::RParen, start);
                item.map(|i| Node::new(start..end, i))
            }
            Some(TokenKind::PitchFrequency) => {
                let token = self.bump().unwrap();
                let bpm = self.bpm_value(token)?;
                let end = self.expect_closing(TokenKind::RParen, start);
                Some(Node::new(start..end, SeqItem::Bpm { anchor: None, bpm }))
            }
            Some(TokenKind::DurationFraction) => {
                let token = self.bump().unwrap();
                let anchor = self.duration_fraction(token).map(Rational::abs);
                if self.eat(TokenKind::Equals).is_none() {
                    self.error("expected '=' after the beat anchor", self.here());
                }
                let bpm = match self.eat(TokenKind::PitchFrequency) {
                    Some(t) => self.bpm_value(t),
                    None => {
                        self.error("expected a BPM value", self.here());
                        None
                    }
                };
                let end = self.expect_closing(TokenKind::RParen, start);
                match (anchor, bpm) {
                    (anchor, Some(bpm)) => {
                        Some(Node::new(start..end, SeqItem::Bpm { anchor, bpm }))
                    }
                    _ => None,
                }
            }
            _ => {
                self.error(
                    "expected a time signature or BPM inside '(...)'",
                    start..self.here().end,
                );
                self.expect_closing(TokenKind::RParen, start);
                None
            }
        }
    }

    fn bpm_value(&mut self, token: &Token) -> Option<f64> {
        let text = self.text(token);
        match text.parse::<f64>() {
            Ok(bpm) if bpm > 0.0 => Some(bpm),
            _ => {
                self.error(format!("invalid BPM value {:?}", text), token.span.clone());
                None
            }
        }
    }

    /// `<spell=value, value, ...>`
    fn parse_base_freq(&mut self) -> Option<Node<SeqItem>> {
        let langle = self.bump().expect("caller checked for '<'");
        let start = langle.span.start;
        let mut defs = Vec::new();

        loop {
            match self.peek_kind() {
                Some(TokenKind::RAngle) | Some(TokenKind::Newline) | None => break,
                Some(kind) if kind.is_pitch() => {
                    let is_spell = matches!(
                        kind,
                        TokenKind::PitchSpellOctave | TokenKind::PitchSpellSimple
                    );
                    let token = self.bump().unwrap();
                    let first = self.pitch_literal(token);
                    if is_spell && self.eat(TokenKind::Equals).is_some() {
                        match self.peek() {
                            Some(next) if next.kind.is_pitch() => {
                                self.bump();
                                if let Some(value) = self.pitch_literal(next) {
                                    defs.push(BaseFreqItem {
                                        spell: first,
                                        value,
                                    });
                                }
                            }
                            _ => {
                                self.error(
                                    "expected a pitch after '=' in base frequency definition",
                                    self.here(),
                                );
                            }
                        }
                    } else if let Some(value) = first {
                        defs.push(BaseFreqItem { spell: None, value });
                    }
                    if self.eat(TokenKind::Comma).is_none() {
                        break;
                    }
                }
                _ => {
                    let span = self.here();
                    self.bump();
                    self.error("unexpected token in base frequency definition", span);
                }
            }
        }

        let end = self.expect_closing(TokenKind::RAngle, start);
        if defs.is_empty() {
            self.error(
                "base frequency definition must contain a pitch",
                start..end,
            );
            return None;
        }
        Some(Node::new(start..end, SeqItem::BaseFreq(defs)))
    }

    /// Consume the closing token if present, diagnosing otherwise.
    /// Returns the end offset of the construct.
    fn expect_closing(&mut self, kind: TokenKind, start: usize) -> usize {
        if let Some(token) = self.eat(kind) {
            token.span.end
        } else {
            let span = self.here();
            self.error(
                format!("expected {}", kind.name()),
                start..span.start.max(start),
            );
            span.start.max(start)
        }
    }

    // ==================== literals ====================

    /// `[n:m]` as the fraction n/m. The sign is preserved: the resolver
    /// rejects negative duration scopes, a BPM anchor only uses the
    /// magnitude.
    fn duration_fraction(&mut self, token: &Token) -> Option<Rational> {
        let text = self.text(token);
        let inner = text.trim_matches(|c| c == '[' || c == ']');
        let mut parts = inner.splitn(2, ':');
        let num = parts.next().and_then(|s| s.parse::<i64>().ok());
        let denom = match parts.next() {
            Some(s) => s.parse::<i64>().ok(),
            None => Some(1),
        };
        match (num, denom) {
            (Some(n), Some(d)) if n != 0 && d > 0 => Some(Rational::new(n, d)),
            _ => {
                self.error(
                    format!("invalid duration {:?}", text),
                    token.span.clone(),
                );
                None
            }
        }
    }

    /// `{n}` sets the beat unit, `{n:m}` quantizes the next group.
    fn quantize(&mut self, token: &Token) -> Option<SeqItem> {
        let text = self.text(token);
        let inner = text.trim_matches(|c| c == '{' || c == '}');
        let mut parts = inner.splitn(2, ':');
        let first = parts.next().and_then(|s| s.parse::<u32>().ok());
        let second = parts.next().map(|s| s.parse::<u32>().ok());
        match (first, second) {
            (Some(n), None) if n > 0 => Some(SeqItem::Unit(n)),
            (Some(n), Some(Some(m))) if n > 0 && m > 0 => {
                if n > m {
                    self.error(
                        format!("quantize uses {} of only {} subdivisions", n, m),
                        token.span.clone(),
                    );
                    return None;
                }
                Some(SeqItem::Quantize { used: n, of: m })
            }
            _ => {
                self.error(format!("invalid quantize {:?}", text), token.span.clone());
                None
            }
        }
    }
}

struct GroupBuilder {
    span: Span,
    voices: Vec<Voice>,
    current: Voice,
}

impl GroupBuilder {
    fn new(start: usize) -> Self {
        GroupBuilder {
            span: start..start,
            voices: Vec::new(),
            current: Voice::default(),
        }
    }

    fn push(&mut self, atom: Node<Atom>) {
        self.span.end = self.span.end.max(atom.span.end);
        self.current.atoms.push(atom);
    }

    fn next_voice(&mut self) {
        self.voices.push(std::mem::take(&mut self.current));
    }

    fn finish(mut self) -> Group {
        self.voices.push(self.current);
        Group {
            voices: self.voices,
        }
    }
}
