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

use crate::lexer::Span;
use symi_core::rational::Rational;

/// A piece of syntax together with the byte range it was parsed from.
/// Every node's span encloses the spans of its children.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<T> {
    pub span: Span,
    pub data: T,
}

impl<T> Node<T> {
    pub fn new(span: Span, data: T) -> Self {
        Node { span, data }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Node<U> {
        Node {
            span: self.span,
            data: f(self.data),
        }
    }

    pub fn replace<U>(&self, data: U) -> Node<U> {
        Node {
            span: self.span.clone(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Root {
    pub lines: Vec<Node<Line>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    /// `name = ...` or `name() = ...` at the start of a line.
    Def(MacroDef),
    /// A line starting with `=`, layered over the preceding play line.
    Ghost(Sequence),
    /// An ordinary line of music.
    Play(Sequence),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroDef {
    pub name: Node<String>,
    /// `name()` definitions advance the caller's cursor by the body
    /// duration; plain definitions are layered under the call site.
    pub relative: bool,
    /// The body, plus one extra voice per ghost line directly below the
    /// definition. All voices start on the same cursor.
    pub voices: Vec<Sequence>,
}

/// The items of one line, in source order. Control headers and duration
/// markers sit between beat groups and do not occupy musical time
/// themselves; the `Advance` item is what moves the clock.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sequence {
    pub items: Vec<Node<SeqItem>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeqItem {
    /// One beat unit worth of music.
    Group(Group),
    /// A `,`: advance the cursor by the effective beat unit.
    Advance,
    /// `(n/m)`
    TimeSig(u32, u32),
    /// `(bpm)` or `([n:m]=bpm)`
    Bpm {
        anchor: Option<Rational>,
        bpm: f64,
    },
    /// `<spell=value, ...>`
    BaseFreq(Vec<BaseFreqItem>),
    /// `[n:m]`: scale the beat unit for the next group and advance.
    Scale(Rational),
    /// `[,,,]`: extend the previous note by the comma count, advancing.
    Extend(u32),
    /// `{n}`: set the beat unit to `1/n` whole notes.
    Unit(u32),
    /// `{n:m}`: quantize the next group, using n of m subdivisions.
    Quantize { used: u32, of: u32 },
}

/// Voices separated by `:` or `;`. All voices start at the group cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub voices: Vec<Voice>,
}

/// Juxtaposed atoms subdividing one beat unit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Voice {
    pub atoms: Vec<Node<Atom>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    /// One pitch, or several joined by `@` into a gliding note.
    Chain(Chain),
    /// A macro invocation; eliminated by expansion.
    Call(String),
    /// The inlined body of a macro call.
    Expanded(Expansion),
    /// A run of dots, occupying as many slots as it has dots.
    Rest(u32),
    /// Extends the previous note on this voice.
    Sustain,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub pitches: Vec<Node<Pitch>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaseFreqItem {
    pub spell: Option<Node<Pitch>>,
    pub value: Node<Pitch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub relative: bool,
    /// The call site this body was inlined at.
    pub call_span: Span,
    /// Parallel voices of the body, all starting on the call cursor.
    pub voices: Vec<Sequence>,
}

/// A pitch literal in parsed form, not yet resolved to Hz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pitch {
    /// Absolute frequency written with a decimal point.
    Frequency(f64),
    /// An integer literal: a frequency in Hz, unless the EDO shorthand
    /// is active, in which case it is a step of the last divisor.
    Integer(i64),
    /// Ratio relative to the current base frequency.
    Ratio(i64, i64),
    /// `step/divisions` octaves above the base.
    Edo { step: i64, divisions: i64 },
    /// `c/1200` octaves above the base.
    Cents(i64),
    /// 12-TET letter spelling with quarter-tone marks.
    Spell(Spell),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spell {
    /// Semitone of the letter within the octave, C = 0 .. B = 11.
    pub letter_semitone: i32,
    /// Net `#` minus `b` count.
    pub accidentals: i32,
    /// Octave number; `None` follows the previous pitch on the voice.
    pub octave: Option<i32>,
    /// Net `+` minus `-` count, in quarter-tones of 50 cents each.
    pub micro: i32,
}

impl Spell {
    /// MIDI-style semitone index (C4 = 60) for a given octave.
    pub fn semitone(&self, octave: i32) -> i32 {
        self.letter_semitone + self.accidentals + (octave + 1) * 12
    }
}
