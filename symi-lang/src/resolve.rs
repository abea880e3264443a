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

//! The timing engine: walks the expanded tree with a running musical
//! clock in exact rational beats and emits a flat, ordered event list.
//!
//! Positions and durations stay rational until the final conversion to
//! seconds through the piecewise-constant BPM schedule. Floating point
//! beats would drift audibly over long pieces with odd time signatures.

use crate::{
    ast::{Atom, Group, Line, Node, Pitch, Root, SeqItem, Sequence},
    diag::Diagnostic,
    lexer::Span,
};
use symi_core::rational::Rational;

/// Frequency of middle C, the base frequency unless a `<...>` header
/// says otherwise.
pub const DEFAULT_BASE_FREQ: f64 = 261.625565;
/// MIDI-style semitone index of middle C.
pub const DEFAULT_BASE_SEMITONE: i32 = 60;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Note(NoteEvent),
    NewMeasure {
        bar: u32,
        start_sec: f64,
        span: Span,
    },
    BaseFrequencyDef {
        freq: f64,
        start_sec: f64,
        span: Span,
    },
}

impl Event {
    pub fn start_sec(&self) -> f64 {
        match self {
            Event::Note(note) => note.start_sec,
            Event::NewMeasure { start_sec, .. } => *start_sec,
            Event::BaseFrequencyDef { start_sec, .. } => *start_sec,
        }
    }

    pub fn span(&self) -> &Span {
        match self {
            Event::Note(note) => &note.span,
            Event::NewMeasure { span, .. } => span,
            Event::BaseFrequencyDef { span, .. } => span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoteEvent {
    /// Frequency at note start, in Hz.
    pub freq: f64,
    /// Target frequency of an `@` chain, glided to over the duration.
    pub glide_to: Option<f64>,
    pub start_sec: f64,
    pub duration_sec: f64,
    /// 0-based bar index.
    pub start_bar: u32,
    /// Position within the bar, as a fraction of a whole note.
    pub start_tick: Rational,
    /// Duration as a fraction of a whole note, in lowest terms.
    pub duration_tick: Rational,
    /// The defining source range of the pitch.
    pub span: Span,
    /// The outermost macro call site, when the note came out of a body.
    pub invoked_span: Option<Span>,
    /// `freq` relative to the base frequency at note start.
    pub pitch_ratio: f64,
}

/// The piecewise-constant tempo and meter schedule, consumed by the MIDI
/// emitter. Both lists start with the defaults at time zero.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoMap {
    pub tempos: Vec<TempoPoint>,
    pub time_sigs: Vec<TimeSigPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoPoint {
    pub start_sec: f64,
    /// Beats per minute, where one beat is `anchor` whole notes.
    pub bpm: f64,
    pub anchor: Rational,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSigPoint {
    pub start_sec: f64,
    pub num: u32,
    pub den: u32,
}

#[derive(Debug)]
pub struct ResolveOutput {
    pub events: Vec<Event>,
    pub tempo: TempoMap,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn resolve(root: &Node<Root>) -> ResolveOutput {
    let mut resolver = Resolver {
        state: State::initial(),
        events: Vec::new(),
        sustains: Vec::new(),
        tempo: TempoMap {
            tempos: vec![TempoPoint {
                start_sec: 0.0,
                bpm: 120.0,
                anchor: Rational::new(1, 4),
            }],
            time_sigs: vec![TimeSigPoint {
                start_sec: 0.0,
                num: 4,
                den: 4,
            }],
        },
        diagnostics: Vec::new(),
        started: false,
    };

    // Snapshot of the state at the start of the last non-ghost line;
    // ghost lines replay from here without advancing the outer cursor.
    let mut line_snapshot: Option<State> = None;

    for line in &root.data.lines {
        match &line.data {
            Line::Def(_) => {}
            Line::Play(seq) => {
                resolver.start_song(&line.span);
                line_snapshot = Some(resolver.state.clone());
                resolver.resolve_sequence(seq, &Ctx::main());
            }
            Line::Ghost(seq) => {
                resolver.start_song(&line.span);
                let saved = std::mem::replace(
                    &mut resolver.state,
                    line_snapshot.clone().unwrap_or_else(State::initial),
                );
                resolver.resolve_sequence(seq, &Ctx::layered());
                resolver.state = saved;
            }
        }
    }

    resolver.finalize_sustains();

    let mut events: Vec<Event> = resolver.events.into_iter().map(|e| e.event).collect();
    events.sort_by(|a, b| a.start_sec().total_cmp(&b.start_sec()));

    ResolveOutput {
        events,
        tempo: resolver.tempo,
        diagnostics: resolver.diagnostics,
    }
}

#[derive(Debug, Clone)]
struct State {
    /// The "one comma" duration, in whole notes.
    unit: Rational,
    /// Bar length in whole notes, num/den of the time signature.
    bar_len: Rational,
    bpm: f64,
    /// Whole notes per beat for the current BPM.
    anchor: Rational,
    base_semitone: i32,
    base_freq: f64,
    /// Divisor of the last explicit EDO literal, 0 when inactive.
    edo_div: i64,
    /// Octave of the most recent spelled pitch.
    last_octave: Option<i32>,
    cursor: Cursor,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    /// Absolute position from song start, in whole notes.
    beats: Rational,
    seconds: f64,
    bar: u32,
    /// Position within the bar, in whole notes.
    tick: Rational,
}

impl State {
    fn initial() -> Self {
        State {
            unit: Rational::new(1, 4),
            bar_len: Rational::one(),
            bpm: 120.0,
            anchor: Rational::new(1, 4),
            base_semitone: DEFAULT_BASE_SEMITONE,
            base_freq: DEFAULT_BASE_FREQ,
            edo_div: 0,
            last_octave: None,
            cursor: Cursor {
                beats: Rational::zero(),
                seconds: 0.0,
                bar: 0,
                tick: Rational::zero(),
            },
        }
    }
}

/// Per-sequence resolution context.
struct Ctx {
    /// Emit measure events and tempo points; only the main cursor does.
    main: bool,
    /// Outermost macro call site, stamped on every nested note.
    invoked: Option<Span>,
}

impl Ctx {
    fn main() -> Self {
        Ctx {
            main: true,
            invoked: None,
        }
    }

    fn layered() -> Self {
        Ctx {
            main: false,
            invoked: None,
        }
    }
}

struct Emitted {
    event: Event,
    /// Absolute end position in whole notes; sustains match against it.
    end_beats: Rational,
}

struct SustainRec {
    start_beats: Rational,
    dur_beats: Rational,
    dur_sec: f64,
    span: Span,
}

struct Resolver {
    state: State,
    events: Vec<Emitted>,
    sustains: Vec<SustainRec>,
    tempo: TempoMap,
    diagnostics: Vec<Diagnostic>,
    started: bool,
}

impl Resolver {
    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::error(message, span));
    }

    fn warning(&mut self, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::warning(message, span));
    }

    /// Seconds taken by a duration at the current tempo.
    fn dur_sec(&self, duration: Rational) -> f64 {
        let whole_notes_per_minute = self.state.bpm * self.state.anchor.to_f64();
        duration.to_f64() / whole_notes_per_minute * 60.0
    }

    /// The measure event for bar 0, emitted once before any content.
    fn start_song(&mut self, span: &Span) {
        if !self.started {
            self.started = true;
            self.events.push(Emitted {
                event: Event::NewMeasure {
                    bar: 0,
                    start_sec: 0.0,
                    span: span.start..span.start,
                },
                end_beats: Rational::zero(),
            });
        }
    }

    fn resolve_sequence(&mut self, seq: &Sequence, ctx: &Ctx) {
        let mut pending_scale: Option<(Rational, Span)> = None;
        let mut pending_quantize: Option<(u32, u32)> = None;
        let mut pending_advance: Option<Rational> = None;
        let mut last_note: Option<usize> = None;

        for item in &seq.items {
            match &item.data {
                SeqItem::Group(group) => {
                    let quantize = pending_quantize.take();
                    if let Some((scale, scale_span)) = &pending_scale {
                        if scale.is_negative() {
                            // the scoped atoms emit nothing, the clock
                            // still moves so the line stays aligned
                            let advance = self.state.unit * scale.abs();
                            self.error("negative duration", scale_span.clone());
                            pending_advance = Some(advance);
                            continue;
                        }
                    }
                    let unit = self.state.unit
                        * pending_scale
                            .as_ref()
                            .map(|(scale, _)| *scale)
                            .unwrap_or_else(Rational::one);
                    let extent = self.resolve_group(group, unit, quantize, ctx, &mut last_note);
                    pending_advance = Some(if extent > unit { extent } else { unit });
                }
                SeqItem::Advance => {
                    let advance = match pending_advance.take() {
                        Some(advance) => advance,
                        None => match &pending_scale {
                            Some((scale, scale_span)) => {
                                if scale.is_negative() {
                                    self.error("negative duration", scale_span.clone());
                                }
                                self.state.unit * scale.abs()
                            }
                            None => self.state.unit,
                        },
                    };
                    pending_scale = None;
                    self.advance_cursor(advance, ctx.main, &item.span);
                }
                SeqItem::TimeSig(num, den) => {
                    if !den.is_power_of_two() {
                        self.warning(
                            format!(
                                "time signature denominator {} is not a power of 2, \
                                 which is discouraged",
                                den
                            ),
                            item.span.clone(),
                        );
                    }
                    self.state.bar_len = Rational::new(*num as i64, *den as i64);
                    // a shrinking bar can leave the cursor past the boundary
                    while self.state.cursor.tick >= self.state.bar_len {
                        self.state.cursor.tick -= self.state.bar_len;
                        self.state.cursor.bar += 1;
                        if ctx.main {
                            self.emit_measure(item.span.clone());
                        }
                    }
                    if ctx.main {
                        self.tempo.time_sigs.push(TimeSigPoint {
                            start_sec: self.state.cursor.seconds,
                            num: *num,
                            den: *den,
                        });
                    }
                }
                SeqItem::Bpm { anchor, bpm } => {
                    if let Some(anchor) = anchor {
                        self.state.anchor = *anchor;
                    }
                    self.state.bpm = *bpm;
                    if ctx.main {
                        self.tempo.tempos.push(TempoPoint {
                            start_sec: self.state.cursor.seconds,
                            bpm: *bpm,
                            anchor: self.state.anchor,
                        });
                    }
                }
                SeqItem::BaseFreq(defs) => {
                    for def in defs {
                        self.apply_base_freq(def, &item.span);
                    }
                }
                SeqItem::Scale(scale) => {
                    pending_scale = Some((*scale, item.span.clone()));
                }
                SeqItem::Extend(count) => {
                    let extension = self.state.unit * *count as i64;
                    match last_note {
                        Some(index) => {
                            let extra_sec = self.dur_sec(extension);
                            let emitted = &mut self.events[index];
                            if let Event::Note(note) = &mut emitted.event {
                                note.duration_tick += extension;
                                note.duration_sec += extra_sec;
                            }
                            emitted.end_beats += extension;
                        }
                        None => {
                            self.error("no note to extend", item.span.clone());
                        }
                    }
                    self.advance_cursor(extension, ctx.main, &item.span);
                }
                SeqItem::Unit(parts) => {
                    self.state.unit = Rational::nth(*parts as i64);
                }
                SeqItem::Quantize { used, of } => {
                    pending_quantize = Some((*used, *of));
                }
            }
        }
    }

    /// Lay out one beat group: all voices start at the cursor, atoms
    /// subdivide the unit. Returns the furthest voice end offset, which
    /// exceeds `unit` only through relative macro bodies.
    fn resolve_group(
        &mut self,
        group: &Group,
        unit: Rational,
        quantize: Option<(u32, u32)>,
        ctx: &Ctx,
        last_note: &mut Option<usize>,
    ) -> Rational {
        let origin = self.state.cursor;
        let mut extent = Rational::zero();

        for voice in &group.voices {
            let slots: i64 = voice
                .atoms
                .iter()
                .map(|atom| match &atom.data {
                    Atom::Rest(count) => (*count).max(1) as i64,
                    _ => 1,
                })
                .sum();
            if slots == 0 {
                continue;
            }
            let slot = match quantize {
                Some((_, of)) => unit / of as i64,
                None => unit / slots,
            };
            let quantize_limit = quantize.map(|(used, _)| used as i64);

            let mut offset = Rational::zero();
            let mut slot_index: i64 = 0;

            for atom in &voice.atoms {
                if let Some(limit) = quantize_limit {
                    if slot_index >= limit && !matches!(atom.data, Atom::Rest(_)) {
                        self.error(
                            "quantize overflow: atom exceeds the used subdivisions",
                            atom.span.clone(),
                        );
                        // the overflowing atom emits nothing
                        continue;
                    }
                }
                match &atom.data {
                    Atom::Chain(chain) => {
                        if let Some(index) =
                            self.emit_chain(chain, atom.span.clone(), origin, offset, slot, ctx)
                        {
                            *last_note = Some(index);
                        }
                        offset += slot;
                        slot_index += 1;
                    }
                    Atom::Rest(count) => {
                        let width = slot * (*count).max(1) as i64;
                        offset += width;
                        slot_index += (*count).max(1) as i64;
                    }
                    Atom::Sustain => {
                        self.sustains.push(SustainRec {
                            start_beats: origin.beats + offset,
                            dur_beats: slot,
                            dur_sec: self.dur_sec(slot),
                            span: atom.span.clone(),
                        });
                        offset += slot;
                        slot_index += 1;
                    }
                    Atom::Expanded(exp) => {
                        let start = self.cursor_plus(origin, offset);
                        let saved = self.state.clone();
                        let sub_ctx = Ctx {
                            main: false,
                            invoked: Some(
                                ctx.invoked.clone().unwrap_or_else(|| exp.call_span.clone()),
                            ),
                        };
                        let mut body_end = start.beats;
                        for voice_seq in &exp.voices {
                            self.state.cursor = start;
                            self.resolve_sequence(voice_seq, &sub_ctx);
                            if self.state.cursor.beats > body_end {
                                body_end = self.state.cursor.beats;
                            }
                        }
                        self.state = saved;
                        if exp.relative {
                            offset += body_end - start.beats;
                        } else {
                            offset += slot;
                        }
                        slot_index += 1;
                    }
                    Atom::Call(name) => {
                        // calls are gone after expansion
                        self.error(
                            format!("unexpanded macro call: {}", name),
                            atom.span.clone(),
                        );
                    }
                }
            }

            if offset > extent {
                extent = offset;
            }
        }

        extent
    }

    /// Emit one note for a pitch chain. Returns its event index.
    fn emit_chain(
        &mut self,
        chain: &crate::ast::Chain,
        span: Span,
        origin: Cursor,
        offset: Rational,
        duration: Rational,
        ctx: &Ctx,
    ) -> Option<usize> {
        let mut freqs = Vec::new();
        for pitch in &chain.pitches {
            if let Some(freq) = self.pitch_to_freq(&pitch.data, &pitch.span) {
                freqs.push(freq);
            }
        }
        let freq = *freqs.first()?;
        let glide_to = match freqs.last() {
            Some(&last) if freqs.len() > 1 && last != freq => Some(last),
            _ => None,
        };

        let at = self.cursor_plus(origin, offset);
        let event = NoteEvent {
            freq,
            glide_to,
            start_sec: at.seconds,
            duration_sec: self.dur_sec(duration),
            start_bar: at.bar,
            start_tick: at.tick,
            duration_tick: duration,
            span,
            invoked_span: ctx.invoked.clone(),
            pitch_ratio: freq / self.state.base_freq,
        };
        self.events.push(Emitted {
            event: Event::Note(event),
            end_beats: at.beats + duration,
        });
        Some(self.events.len() - 1)
    }

    /// Resolve a pitch literal to Hz against the current state.
    fn pitch_to_freq(&mut self, pitch: &Pitch, span: &Span) -> Option<f64> {
        match pitch {
            Pitch::Frequency(hz) => {
                self.state.edo_div = 0;
                self.checked_freq(*hz, span)
            }
            Pitch::Integer(value) => {
                if self.state.edo_div > 0 {
                    let divisions = self.state.edo_div;
                    Some(self.state.base_freq * edo_ratio(*value, divisions))
                } else {
                    self.checked_freq(*value as f64, span)
                }
            }
            Pitch::Ratio(num, denom) => {
                Some(self.state.base_freq * (*num as f64) / (*denom as f64))
            }
            Pitch::Edo { step, divisions } => {
                self.state.edo_div = *divisions;
                Some(self.state.base_freq * edo_ratio(*step, *divisions))
            }
            Pitch::Cents(cents) => {
                Some(self.state.base_freq * 2f64.powf(*cents as f64 / 1200.0))
            }
            Pitch::Spell(spell) => {
                let octave = spell.octave.or(self.state.last_octave).unwrap_or(4);
                self.state.last_octave = Some(octave);
                let semitone = spell.semitone(octave);
                let semitone_diff = (semitone - self.state.base_semitone) as f64;
                Some(
                    self.state.base_freq
                        * 2f64.powf(semitone_diff / 12.0)
                        * 2f64.powf(spell.micro as f64 / 24.0),
                )
            }
        }
    }

    fn checked_freq(&mut self, hz: f64, span: &Span) -> Option<f64> {
        if hz >= 1.0 && hz < 1e8 {
            Some(hz)
        } else {
            self.error(format!("frequency {} out of range", hz), span.clone());
            None
        }
    }

    fn apply_base_freq(&mut self, def: &crate::ast::BaseFreqItem, span: &Span) {
        let spell_semitone = def.spell.as_ref().and_then(|node| match &node.data {
            Pitch::Spell(spell) => Some(spell.semitone(spell.octave.unwrap_or(4))),
            _ => None,
        });

        let freq = match self.pitch_to_freq(&def.value.data, &def.value.span) {
            Some(freq) => freq,
            None => return,
        };
        if freq <= 0.0 {
            self.error("base frequency must be positive", span.clone());
            return;
        }

        self.state.base_semitone = match spell_semitone {
            Some(semitone) => semitone,
            None => {
                // nearest spelling of the new frequency under the old base
                let diff = 12.0 * (freq / self.state.base_freq).log2();
                self.state.base_semitone + diff.round() as i32
            }
        };
        self.state.base_freq = freq;

        self.events.push(Emitted {
            event: Event::BaseFrequencyDef {
                freq,
                start_sec: self.state.cursor.seconds,
                span: span.clone(),
            },
            end_beats: self.state.cursor.beats,
        });
    }

    /// Position `offset` whole notes after `origin`, under the current
    /// time signature and tempo.
    fn cursor_plus(&self, origin: Cursor, offset: Rational) -> Cursor {
        let mut bar = origin.bar;
        let mut tick = origin.tick + offset;
        while tick >= self.state.bar_len {
            tick -= self.state.bar_len;
            bar += 1;
        }
        Cursor {
            beats: origin.beats + offset,
            seconds: origin.seconds + self.dur_sec(offset),
            bar,
            tick,
        }
    }

    /// Advance the main cursor, emitting a measure event at every bar
    /// boundary it crosses.
    fn advance_cursor(&mut self, duration: Rational, emit_measures: bool, span: &Span) {
        let mut remaining = duration;
        loop {
            let to_boundary = self.state.bar_len - self.state.cursor.tick;
            if remaining >= to_boundary {
                self.step(to_boundary);
                self.state.cursor.tick = Rational::zero();
                self.state.cursor.bar += 1;
                if emit_measures {
                    self.emit_measure(span.clone());
                }
                remaining -= to_boundary;
                if remaining.is_zero() {
                    break;
                }
            } else {
                self.step(remaining);
                self.state.cursor.tick += remaining;
                break;
            }
        }
    }

    fn step(&mut self, duration: Rational) {
        self.state.cursor.beats += duration;
        self.state.cursor.seconds += self.dur_sec(duration);
    }

    fn emit_measure(&mut self, span: Span) {
        let cursor = self.state.cursor;
        self.events.push(Emitted {
            event: Event::NewMeasure {
                bar: cursor.bar,
                start_sec: cursor.seconds,
                span,
            },
            end_beats: cursor.beats,
        });
    }

    /// Apply recorded sustains: each one lengthens every note that ends
    /// exactly where the sustain starts. Exact rational positions make
    /// the match test trivial.
    fn finalize_sustains(&mut self) {
        let sustains = std::mem::take(&mut self.sustains);
        for sustain in sustains {
            let mut matched = false;
            for emitted in &mut self.events {
                if let Event::Note(note) = &mut emitted.event {
                    if emitted.end_beats == sustain.start_beats {
                        note.duration_tick += sustain.dur_beats;
                        note.duration_sec += sustain.dur_sec;
                        emitted.end_beats += sustain.dur_beats;
                        matched = true;
                    }
                }
            }
            if !matched {
                self.error("sustain has no preceding note to extend", sustain.span);
            }
        }
    }
}

fn edo_ratio(step: i64, divisions: i64) -> f64 {
    2f64.powf(step as f64 / divisions as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{expand::expand, parser::parse};

    const EPS: f64 = 1e-6;

    fn run(source: &str) -> ResolveOutput {
        let parsed = parse(source);
        let (root, expand_diags) = expand(parsed.root);
        let mut output = resolve(&root);
        let mut diags = parsed.diagnostics;
        diags.extend(expand_diags);
        diags.append(&mut output.diagnostics);
        output.diagnostics = diags;
        output
    }

    fn notes(output: &ResolveOutput) -> Vec<&NoteEvent> {
        output
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Note(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    fn assert_close(actual: f64, expected: f64, what: &str) {
        assert!(
            (actual - expected).abs() < 1e-2,
            "{}: expected {}, got {}",
            what,
            expected,
            actual
        );
    }

    #[test]
    fn four_quarters_at_120() {
        let output = run("(4/4)(120) C4,D4,E4,F4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);

        let notes = notes(&output);
        assert_eq!(notes.len(), 4);
        let expected = [
            (0.0, 261.625565),
            (0.5, 293.664768),
            (1.0, 329.627557),
            (1.5, 349.228231),
        ];
        for (note, &(start, freq)) in notes.iter().zip(expected.iter()) {
            assert!((note.start_sec - start).abs() < EPS);
            assert!((note.duration_sec - 0.5).abs() < EPS);
            assert_close(note.freq, freq, "freq");
            assert_eq!(note.start_bar, 0);
        }

        let measures: Vec<(u32, f64)> = output
            .events
            .iter()
            .filter_map(|e| match e {
                Event::NewMeasure { bar, start_sec, .. } => Some((*bar, *start_sec)),
                _ => None,
            })
            .collect();
        assert_eq!(measures.len(), 2);
        assert_eq!(measures[0].0, 0);
        assert!((measures[0].1 - 0.0).abs() < EPS);
        assert_eq!(measures[1].0, 1);
        assert!((measures[1].1 - 2.0).abs() < EPS);
    }

    #[test]
    fn macro_chord_shares_the_first_bar() {
        let source = "lo = {4}C,D,E,F,\nlo:A,B,C+,D+,\n";
        let output = run(source);
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);

        let notes = notes(&output);
        assert_eq!(notes.len(), 8);
        for note in &notes {
            assert_eq!(note.start_bar, 0, "note {:?}", note);
        }

        let def_region = source.find('\n').unwrap();
        let from_macro: Vec<_> = notes
            .iter()
            .filter(|n| n.invoked_span.is_some())
            .collect();
        assert_eq!(from_macro.len(), 4);
        for note in from_macro {
            // defining span inside the body, invoked span at the call
            assert!(note.span.end <= def_region);
            let invoked = note.invoked_span.clone().unwrap();
            assert_eq!(&source[invoked], "lo");
        }
    }

    #[test]
    fn base_frequency_definition() {
        let output = run("<A4=432> A4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);

        let base = output
            .events
            .iter()
            .find_map(|e| match e {
                Event::BaseFrequencyDef { freq, start_sec, .. } => Some((*freq, *start_sec)),
                _ => None,
            })
            .expect("expected a base frequency event");
        assert!((base.0 - 432.0).abs() < EPS);
        assert!((base.1 - 0.0).abs() < EPS);

        let notes = notes(&output);
        assert_eq!(notes.len(), 1);
        assert!((notes[0].freq - 432.0).abs() < EPS);
        assert!((notes[0].pitch_ratio - 1.0).abs() < EPS);
    }

    #[test]
    fn third_duration_scopes() {
        let output = run("(120) [1:3]C4,[1:3]D4,[1:3]E4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);

        let notes = notes(&output);
        assert_eq!(notes.len(), 3);
        let third = 0.5 / 3.0;
        for (index, note) in notes.iter().enumerate() {
            assert!((note.duration_sec - third).abs() < EPS);
            assert!((note.start_sec - third * index as f64).abs() < EPS);
        }
    }

    #[test]
    fn chain_keeps_start_frequency_and_ratio() {
        // the glide itself resolves fine; whether MIDI can express it
        // is the emitter's problem
        let output = run("C4@G4\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);

        let notes = notes(&output);
        assert_eq!(notes.len(), 1);
        assert_close(notes[0].freq, 261.625565, "start freq");
        assert!((notes[0].pitch_ratio - 1.0).abs() < EPS);
        let glide = notes[0].glide_to.expect("expected a glide target");
        assert_close(glide, 391.995436, "glide target");
    }

    #[test]
    fn recursive_macro_emits_nothing() {
        let output = run("x = x\nx\n");
        let errors: Vec<_> = output
            .diagnostics
            .iter()
            .filter(|d| d.is_error())
            .collect();
        assert_eq!(errors.len(), 1, "{:?}", output.diagnostics);
        assert!(errors[0].message.contains("recursive macro"));
        assert!(notes(&output).is_empty());
    }

    #[test]
    fn comma_duration_extends_the_last_note() {
        let output = run("{4}A,B,C,D,[,,,]\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);

        let notes = notes(&output);
        assert_eq!(notes.len(), 4);
        let short = notes[0].duration_sec;
        for note in &notes[..3] {
            assert!((note.duration_sec - short).abs() < EPS);
        }
        assert!((notes[3].duration_sec - short * 4.0).abs() < EPS);
        assert_eq!(notes[3].duration_tick, Rational::one());
    }

    #[test]
    fn sustain_lengthens_the_previous_note() {
        let output = run("C4,-,D4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);

        let notes = notes(&output);
        assert_eq!(notes.len(), 2);
        assert!((notes[0].duration_sec - 1.0).abs() < EPS);
        assert_eq!(notes[0].duration_tick, Rational::new(1, 2));
        // the following note starts after the sustained beat
        assert!((notes[1].start_sec - 1.0).abs() < EPS);
    }

    #[test]
    fn sustain_extends_all_chord_voices() {
        let output = run("C4:E4,-,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert_eq!(notes.len(), 2);
        for note in &notes {
            assert_eq!(note.duration_tick, Rational::new(1, 2));
        }
    }

    #[test]
    fn dangling_sustain_is_an_error() {
        let output = run("-,C4,\n");
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.message.contains("sustain has no preceding note")));
    }

    #[test]
    fn ghost_line_layers_over_previous_line() {
        let output = run("C4,D4,\n=E4,F4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);

        let notes = notes(&output);
        assert_eq!(notes.len(), 4);
        // both lines start at the same cursor, so the sorted event list
        // pairs them up beat by beat
        let starts: Vec<f64> = notes.iter().map(|n| n.start_sec).collect();
        assert!((starts[0] - starts[1]).abs() < EPS);
        assert!((starts[2] - starts[3]).abs() < EPS);
        assert!(starts[2] > starts[0]);
    }

    #[test]
    fn voices_start_together() {
        let output = run("C4;E4;G4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert_eq!(notes.len(), 3);
        for note in &notes {
            assert!((note.start_sec - 0.0).abs() < EPS);
        }
    }

    #[test]
    fn juxtaposed_atoms_subdivide_the_beat() {
        let output = run("{4}C4 D4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert_eq!(notes.len(), 2);
        assert!((notes[0].duration_sec - 0.25).abs() < EPS);
        assert!((notes[1].start_sec - 0.25).abs() < EPS);
        assert_eq!(notes[0].duration_tick, Rational::new(1, 8));
    }

    #[test]
    fn quantize_pads_the_rest_of_the_unit() {
        // two atoms in 2 of 4 subdivisions, half the unit stays silent
        let output = run("{2:4}C4 D4,E4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].duration_tick, Rational::new(1, 16));
        assert!((notes[1].start_sec - 0.125).abs() < EPS);
        // the next beat starts a full unit later regardless
        assert!((notes[2].start_sec - 0.5).abs() < EPS);
    }

    #[test]
    fn quantize_overflow_is_diagnosed_and_suppressed() {
        let output = run("{1:4}C4 D4,\n");
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.is_error() && d.message.contains("quantize overflow")));
        // the overflowing atom produced no event
        assert_eq!(notes(&output).len(), 1);
    }

    #[test]
    fn negative_duration_is_diagnosed_and_suppressed() {
        let output = run("[-1:4]C4,D4,\n");
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.is_error() && d.message.contains("negative duration")));

        // C4 is dropped; the cursor still advances by the magnitude,
        // so D4 lands a sixteenth of a whole note in
        let notes = notes(&output);
        assert_eq!(notes.len(), 1);
        assert!((notes[0].start_sec - 0.125).abs() < EPS);
    }

    #[test]
    fn negative_anchor_still_sets_the_tempo() {
        let output = run("([-1:8]=120) C4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert!((notes[0].duration_sec - 1.0).abs() < EPS);
    }

    #[test]
    fn rests_occupy_their_slots() {
        let output = run("{4}C4 .. D4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert_eq!(notes.len(), 2);
        // four slots: note, two rests, note
        assert_eq!(notes[0].duration_tick, Rational::new(1, 16));
        assert!((notes[1].start_sec - 0.375).abs() < EPS);
    }

    #[test]
    fn edo_shorthand_reuses_the_divisor() {
        let output = run("7\\12,9,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert_eq!(notes.len(), 2);
        let base = DEFAULT_BASE_FREQ;
        assert_close(notes[0].freq, base * 2f64.powf(7.0 / 12.0), "edo literal");
        assert_close(notes[1].freq, base * 2f64.powf(9.0 / 12.0), "edo shorthand");
    }

    #[test]
    fn ratio_and_cents_track_the_base() {
        let output = run("<440.0> 3/2,100c,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert_close(notes[0].freq, 660.0, "ratio");
        assert_close(notes[1].freq, 440.0 * 2f64.powf(1.0 / 12.0), "cents");
        assert!((notes[0].pitch_ratio - 1.5).abs() < EPS);
    }

    #[test]
    fn octave_defaults_follow_the_previous_pitch() {
        let output = run("C3,D,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        // D without octave lands in octave 3, next to C3
        let c3 = DEFAULT_BASE_FREQ / 2.0;
        assert_close(notes[0].freq, c3, "C3");
        assert_close(notes[1].freq, c3 * 2f64.powf(2.0 / 12.0), "D3");
    }

    #[test]
    fn spell_micro_marks_shift_quarter_tones() {
        let output = run("C4+,C4-,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        let base = DEFAULT_BASE_FREQ;
        assert_close(notes[0].freq, base * 2f64.powf(1.0 / 24.0), "C4+");
        assert_close(notes[1].freq, base * 2f64.powf(-1.0 / 24.0), "C4-");
    }

    #[test]
    fn anchored_bpm_changes_the_beat_value() {
        // an eighth-note beat at 120 makes each quarter unit a second
        let output = run("([1:8]=120) C4,D4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert!((notes[0].duration_sec - 1.0).abs() < EPS);
        assert!((notes[1].start_sec - 1.0).abs() < EPS);
    }

    #[test]
    fn bpm_change_mid_line_is_piecewise() {
        let output = run("(60) C4,(120) D4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert!((notes[0].duration_sec - 1.0).abs() < EPS);
        assert!((notes[1].start_sec - 1.0).abs() < EPS);
        assert!((notes[1].duration_sec - 0.5).abs() < EPS);
        assert_eq!(output.tempo.tempos.len(), 3);
    }

    #[test]
    fn events_are_sorted_by_start() {
        let output = run("lo = {4}C,D,E,F,\nlo:A,B,C+,D+,\n");
        let mut last = 0.0;
        for event in &output.events {
            assert!(event.start_sec() >= last - EPS);
            last = event.start_sec();
        }
    }

    #[test]
    fn relative_macro_advances_the_cursor() {
        let output = run("lo() = C4,D4,\nlo,E4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert_eq!(notes.len(), 3);
        // E4 comes after the two-beat body
        assert!((notes[2].start_sec - 1.0).abs() < EPS);
    }

    #[test]
    fn absolute_macro_layers_under_the_beat() {
        let output = run("lo = C4,D4,\nlo,E4,\n");
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let notes = notes(&output);
        assert_eq!(notes.len(), 3);
        // E4 sits on the second beat, under the still-sounding body
        assert!((notes[2].start_sec - 0.5).abs() < EPS);
    }

    #[test]
    fn total_voice_duration_matches_cursor_span() {
        let output = run("(120) C4,D4,E4,F4,G4,A4,\n");
        let notes = notes(&output);
        let total: f64 = notes.iter().map(|n| n.duration_sec).sum();
        let first = notes.first().unwrap().start_sec;
        let last = notes.last().unwrap();
        assert!((total - (last.start_sec + last.duration_sec - first)).abs() < 1e-9);
    }
}
