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

//! Serializes a resolved event stream to a type-1 Standard MIDI File.
//!
//! MIDI has no native notion of arbitrary frequencies, so every note is
//! mapped to its nearest 12-TET key plus a per-channel pitch bend. A
//! channel can only hold one bend value at a time, which makes channel
//! assignment an interval coloring problem: notes that agree within the
//! pitch tolerance share a channel, everything else gets its own, and
//! when the 15 usable channels run out the allocator continues on a new
//! bank of tracks. Validation runs before any bytes are produced; a
//! failed export writes nothing.

use midly::{
    num::{u14, u15, u24, u28, u4, u7},
    Format, Header, MetaMessage, MidiMessage, PitchBend, Smf, TrackEvent, TrackEventKind,
};
use snafu::Snafu;
use symi_lang::lexer::Span;
use symi_lang::resolve::{Event, TempoMap};

/// Options for one export run. The defaults match what most hardware
/// General MIDI synths expect.
#[derive(Debug, Clone, Copy)]
pub struct MidiConfig {
    pub pitch_bend_range_semitones: u16,
    pub ticks_per_quarter: u32,
    pub time_tolerance_seconds: f64,
    pub pitch_tolerance_cents: f64,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            pitch_bend_range_semitones: 2,
            ticks_per_quarter: 480,
            time_tolerance_seconds: 1e-4,
            pitch_tolerance_cents: 3.0,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ExportError {
    #[snafu(display("ticks per quarter must be between 1 and 32767, got {}", tpq))]
    InvalidResolution { tpq: u32 },

    #[snafu(display(
        "pitch at {}..{} needs a bend of {:.1} cents, beyond the +-{} semitone bend range",
        span.start, span.end, cents, range
    ))]
    BendOutOfRange { cents: f64, range: u16, span: Span },

    #[snafu(display(
        "{} drifts by {:.6} at {}..{}, beyond the configured tolerance of {:.6}",
        quantity, drift, span.start, span.end, tolerance
    ))]
    ToleranceExceeded {
        /// What drifted: "note onset (seconds)" or "pitch bend (cents)".
        quantity: &'static str,
        drift: f64,
        tolerance: f64,
        span: Span,
    },

    #[snafu(display("note at {}..{} has a non-positive duration", span.start, span.end))]
    InvalidNote { span: Span },

    #[snafu(display("time signature {}/{} cannot be written to MIDI", num, den))]
    InvalidTimeSignature { num: u32, den: u32 },

    #[snafu(display("more than {} pitch-bend channels would be required", max))]
    NoChannelAvailable { max: usize },

    #[snafu(display("failed to serialize MIDI: {}", source))]
    Serialize { source: std::io::Error },
}

const BEND_CENTER: i32 = 8192;
const BEND_MIN: i32 = -8192;
const BEND_MAX: i32 = 8191;
/// 16 MIDI channels minus the percussion channel 10 (0-based 9).
const CHANNELS_PER_BANK: usize = 15;
/// Four banks of tracks; needing more than this is a configuration
/// problem, not a score.
const MAX_SLOTS: usize = 4 * CHANNELS_PER_BANK;
/// Number of linear interpolation segments for a glide ramp.
const GLIDE_SEGMENTS: u64 = 16;

/// Serialize the event stream to SMF bytes. Validation runs first; on
/// any failure no bytes are produced.
pub fn export(
    events: &[Event],
    tempo: &TempoMap,
    config: &MidiConfig,
) -> Result<Vec<u8>, ExportError> {
    let tpq = check_resolution(config.ticks_per_quarter)?;
    let clock = TickClock::new(tempo, tpq);

    for sig in &tempo.time_sigs {
        if sig.num == 0 || sig.num > 255 || !sig.den.is_power_of_two() || sig.den > 255 {
            return Err(ExportError::InvalidTimeSignature {
                num: sig.num,
                den: sig.den,
            });
        }
    }

    let specs = validate_notes(events, config, &clock)?;
    let groups = merge_same_start(specs, config.pitch_tolerance_cents);
    let slots = assign_slots(groups, config.time_tolerance_seconds)?;

    let mut tracks = Vec::with_capacity(slots.len() + 1);
    tracks.push(build_meta_track(tempo, &clock));
    for (index, slot) in slots.iter().enumerate() {
        tracks.push(build_note_track(
            slot,
            channel_for_slot(index),
            config.pitch_bend_range_semitones,
            &clock,
        ));
    }

    let smf = Smf {
        header: Header {
            format: Format::Parallel,
            timing: midly::Timing::Metrical(u15::new(tpq)),
        },
        tracks,
    };

    let mut buffer = Vec::new();
    smf.write_std(&mut buffer)
        .map_err(|source| ExportError::Serialize { source })?;
    Ok(buffer)
}

fn check_resolution(tpq: u32) -> Result<u16, ExportError> {
    if tpq == 0 || tpq > 0x7FFF {
        return Err(ExportError::InvalidResolution { tpq });
    }
    Ok(tpq as u16)
}

// ==================== time conversion ====================

struct TickPoint {
    start_sec: f64,
    start_tick: u64,
    /// Microseconds per quarter note.
    mpq: f64,
}

/// Piecewise-linear seconds/ticks conversion along the tempo schedule.
struct TickClock {
    points: Vec<TickPoint>,
    tpq: u16,
}

impl TickClock {
    fn new(tempo: &TempoMap, tpq: u16) -> Self {
        let mut raw: Vec<(f64, f64)> = tempo
            .tempos
            .iter()
            .map(|point| {
                let quarter_bpm = point.bpm * point.anchor.to_f64() * 4.0;
                let mpq = (60e6 / quarter_bpm).clamp(1.0, 16_777_215.0);
                (point.start_sec, mpq)
            })
            .collect();
        raw.sort_by(|a, b| a.0.total_cmp(&b.0));

        // several changes at the same instant collapse to the last one
        let mut dedup: Vec<(f64, f64)> = Vec::with_capacity(raw.len());
        for (sec, mpq) in raw {
            match dedup.last_mut() {
                Some((last_sec, last_mpq)) if (*last_sec - sec).abs() < 1e-9 => *last_mpq = mpq,
                _ => dedup.push((sec, mpq)),
            }
        }

        let mut points: Vec<TickPoint> = Vec::with_capacity(dedup.len());
        let mut accum: u64 = 0;
        for (index, &(sec, mpq)) in dedup.iter().enumerate() {
            if index > 0 {
                let (prev_sec, prev_mpq) = dedup[index - 1];
                accum += ticks_in(sec - prev_sec, prev_mpq, tpq);
            }
            points.push(TickPoint {
                start_sec: sec,
                start_tick: accum,
                mpq,
            });
        }
        TickClock { points, tpq }
    }

    fn sec_to_tick(&self, sec: f64) -> u64 {
        let base = self
            .points
            .iter()
            .rev()
            .find(|p| p.start_sec <= sec + 1e-12)
            .unwrap_or(&self.points[0]);
        base.start_tick + ticks_in((sec - base.start_sec).max(0.0), base.mpq, self.tpq)
    }

    fn tick_to_sec(&self, tick: u64) -> f64 {
        let base = self
            .points
            .iter()
            .rev()
            .find(|p| p.start_tick <= tick)
            .unwrap_or(&self.points[0]);
        base.start_sec + (tick - base.start_tick) as f64 * base.mpq / 1e6 / self.tpq as f64
    }
}

fn ticks_in(seconds: f64, mpq: f64, tpq: u16) -> u64 {
    let ticks = seconds * 1e6 / mpq * tpq as f64;
    if ticks.is_finite() && ticks > 0.0 {
        ticks.round() as u64
    } else {
        0
    }
}

// ==================== validation ====================

#[derive(Debug, Clone)]
struct NoteSpec {
    start_sec: f64,
    end_sec: f64,
    key: u8,
    /// Signed bend in 14-bit units relative to the 8192 center.
    bend: i32,
    bend_cents: f64,
    /// Bend at the end of a glide; ramped to linearly.
    glide_bend: Option<i32>,
    span: Span,
}

fn validate_notes(
    events: &[Event],
    config: &MidiConfig,
    clock: &TickClock,
) -> Result<Vec<NoteSpec>, ExportError> {
    let range = config.pitch_bend_range_semitones;
    let mut specs = Vec::new();

    for event in events {
        let note = match event {
            Event::Note(note) => note,
            _ => continue,
        };
        if note.duration_sec <= 0.0 || note.freq <= 0.0 {
            return Err(ExportError::InvalidNote {
                span: note.span.clone(),
            });
        }

        let (key, bend, bend_cents) = key_and_bend(note.freq, range, &note.span)?;

        // the bend resolution must reproduce the pitch faithfully enough
        let emitted_cents = bend as f64 / BEND_CENTER as f64 * range as f64 * 100.0;
        let pitch_drift = (emitted_cents - bend_cents).abs();
        if pitch_drift > config.pitch_tolerance_cents {
            return Err(ExportError::ToleranceExceeded {
                quantity: "pitch bend (cents)",
                drift: pitch_drift,
                tolerance: config.pitch_tolerance_cents,
                span: note.span.clone(),
            });
        }

        // glides bend away from the *starting* key
        let glide_bend = match note.glide_to {
            Some(target) => {
                let exact = 69.0 + 12.0 * (target / 440.0).log2();
                let cents = (exact - key as f64) * 100.0;
                if cents.abs() > f64::from(range) * 100.0 {
                    return Err(ExportError::BendOutOfRange {
                        cents,
                        range,
                        span: note.span.clone(),
                    });
                }
                Some(cents_to_bend(cents, range))
            }
            None => None,
        };

        // rounding the onset to ticks must stay within the tolerance
        let tick = clock.sec_to_tick(note.start_sec);
        let time_drift = (clock.tick_to_sec(tick) - note.start_sec).abs();
        if time_drift > config.time_tolerance_seconds {
            return Err(ExportError::ToleranceExceeded {
                quantity: "note onset (seconds)",
                drift: time_drift,
                tolerance: config.time_tolerance_seconds,
                span: note.span.clone(),
            });
        }

        specs.push(NoteSpec {
            start_sec: note.start_sec,
            end_sec: note.start_sec + note.duration_sec,
            key,
            bend,
            bend_cents,
            glide_bend,
            span: note.span.clone(),
        });
    }

    Ok(specs)
}

fn key_and_bend(freq: f64, range: u16, span: &Span) -> Result<(u8, i32, f64), ExportError> {
    let exact = 69.0 + 12.0 * (freq / 440.0).log2();
    let key = exact.round().clamp(0.0, 127.0);
    let cents = (exact - key) * 100.0;
    if cents.abs() > f64::from(range) * 100.0 {
        return Err(ExportError::BendOutOfRange {
            cents,
            range,
            span: span.clone(),
        });
    }
    Ok((key as u8, cents_to_bend(cents, range), cents))
}

fn cents_to_bend(cents: f64, range: u16) -> i32 {
    let ratio = cents / 100.0 / f64::from(range);
    ((ratio * BEND_CENTER as f64).round() as i32).clamp(BEND_MIN, BEND_MAX)
}

// ==================== channel assignment ====================

/// Notes that start together and agree on their bend within the pitch
/// tolerance share a channel; the bend is averaged over the members.
#[derive(Debug, Clone)]
struct BendGroup {
    start_sec: f64,
    end_sec: f64,
    bend: i32,
    bend_cents: f64,
    glide_bend: Option<i32>,
    notes: Vec<NoteSpec>,
}

fn merge_same_start(mut specs: Vec<NoteSpec>, pitch_tolerance_cents: f64) -> Vec<BendGroup> {
    specs.sort_by(|a, b| {
        a.start_sec
            .total_cmp(&b.start_sec)
            .then_with(|| a.bend_cents.total_cmp(&b.bend_cents))
    });

    let mut groups: Vec<BendGroup> = Vec::new();
    for spec in specs {
        let mergeable = spec.glide_bend.is_none();
        if mergeable {
            if let Some(group) = groups.iter_mut().find(|group| {
                group.glide_bend.is_none()
                    && (group.start_sec - spec.start_sec).abs() < 1e-9
                    && (group.bend_cents - spec.bend_cents).abs() <= pitch_tolerance_cents
            }) {
                group.end_sec = group.end_sec.max(spec.end_sec);
                group.notes.push(spec);
                let n = group.notes.len() as f64;
                group.bend_cents = group
                    .notes
                    .iter()
                    .map(|note| note.bend_cents)
                    .sum::<f64>()
                    / n;
                let bend_sum: i32 = group.notes.iter().map(|note| note.bend).sum();
                group.bend = (bend_sum as f64 / n).round() as i32;
                continue;
            }
        }

        groups.push(BendGroup {
            start_sec: spec.start_sec,
            end_sec: spec.end_sec,
            bend: spec.bend,
            bend_cents: spec.bend_cents,
            glide_bend: spec.glide_bend,
            notes: vec![spec],
        });
    }
    groups
}

/// Greedy interval coloring over the bend groups. A slot is one
/// (track, channel) pair; overlaps smaller than the time tolerance are
/// clipped instead of forcing a new slot.
fn assign_slots(
    groups: Vec<BendGroup>,
    time_tolerance_seconds: f64,
) -> Result<Vec<Vec<BendGroup>>, ExportError> {
    let mut slots: Vec<Vec<BendGroup>> = Vec::new();

    for group in groups {
        let mut placed = false;
        for slot in &mut slots {
            let fits = match slot.last_mut() {
                None => true,
                Some(last) => {
                    if group.start_sec >= last.end_sec {
                        true
                    } else {
                        let overlap = last.end_sec - group.start_sec;
                        if overlap <= time_tolerance_seconds {
                            last.end_sec = group.start_sec;
                            for note in &mut last.notes {
                                note.end_sec = note.end_sec.min(group.start_sec);
                            }
                            true
                        } else {
                            false
                        }
                    }
                }
            };
            if fits {
                slot.push(group.clone());
                placed = true;
                break;
            }
        }
        if !placed {
            if slots.len() == MAX_SLOTS {
                return Err(ExportError::NoChannelAvailable { max: MAX_SLOTS });
            }
            slots.push(vec![group]);
        }
    }

    Ok(slots)
}

fn channel_for_slot(slot: usize) -> u8 {
    let within = (slot % CHANNELS_PER_BANK) as u8;
    // channel 10 (0-based 9) is reserved for percussion
    if within >= 9 {
        within + 1
    } else {
        within
    }
}

// ==================== serialization ====================

struct AbsEvent {
    tick: u64,
    /// Events on the same tick order as: off, bend, on.
    priority: u8,
    kind: TrackEventKind<'static>,
}

fn build_meta_track(tempo: &TempoMap, clock: &TickClock) -> Vec<TrackEvent<'static>> {
    let mut abs = Vec::new();

    for point in &clock.points {
        abs.push(AbsEvent {
            tick: point.start_tick,
            priority: 0,
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(point.mpq.round() as u32))),
        });
    }

    for sig in &tempo.time_sigs {
        abs.push(AbsEvent {
            tick: clock.sec_to_tick(sig.start_sec),
            priority: 1,
            kind: TrackEventKind::Meta(MetaMessage::TimeSignature(
                sig.num as u8,
                sig.den.trailing_zeros() as u8,
                24,
                8,
            )),
        });
    }

    to_delta_track(abs)
}

fn build_note_track(
    groups: &[BendGroup],
    channel: u8,
    bend_range: u16,
    clock: &TickClock,
) -> Vec<TrackEvent<'static>> {
    let channel = u4::new(channel);
    let mut abs = Vec::new();

    // RPN 0,0 configures the pitch bend range for the whole track
    let controller = |controller: u8, value: u8| TrackEventKind::Midi {
        channel,
        message: MidiMessage::Controller {
            controller: u7::new(controller),
            value: u7::new(value),
        },
    };
    for (cc, value) in [
        (101u8, 0u8),
        (100, 0),
        (6, bend_range.min(127) as u8),
        (38, 0),
    ] {
        abs.push(AbsEvent {
            tick: 0,
            priority: 0,
            kind: controller(cc, value),
        });
    }

    for group in groups {
        let start_tick = clock.sec_to_tick(group.start_sec);
        abs.push(AbsEvent {
            tick: start_tick,
            priority: 1,
            kind: bend_event(channel, group.bend),
        });

        let group_end_tick = clock.sec_to_tick(group.end_sec).max(start_tick + 1);
        if let Some(target) = group.glide_bend {
            for step in 1..=GLIDE_SEGMENTS {
                let tick = start_tick + (group_end_tick - start_tick) * step / GLIDE_SEGMENTS;
                if tick == start_tick {
                    continue;
                }
                let fraction = step as f64 / GLIDE_SEGMENTS as f64;
                let bend =
                    group.bend + ((target - group.bend) as f64 * fraction).round() as i32;
                abs.push(AbsEvent {
                    tick,
                    priority: 1,
                    kind: bend_event(channel, bend),
                });
            }
        }

        for note in &group.notes {
            let key = u7::new(note.key);
            abs.push(AbsEvent {
                tick: start_tick,
                priority: 2,
                kind: TrackEventKind::Midi {
                    channel,
                    message: MidiMessage::NoteOn {
                        key,
                        vel: u7::new(100),
                    },
                },
            });
            let end_tick = clock.sec_to_tick(note.end_sec).max(start_tick + 1);
            abs.push(AbsEvent {
                tick: end_tick,
                priority: 0,
                kind: TrackEventKind::Midi {
                    channel,
                    message: MidiMessage::NoteOff {
                        key,
                        vel: u7::new(0),
                    },
                },
            });
        }
    }

    to_delta_track(abs)
}

fn bend_event(channel: u4, bend: i32) -> TrackEventKind<'static> {
    let value = (bend.clamp(BEND_MIN, BEND_MAX) + BEND_CENTER) as u16;
    TrackEventKind::Midi {
        channel,
        message: MidiMessage::PitchBend {
            bend: PitchBend(u14::new(value)),
        },
    }
}

fn to_delta_track(mut abs: Vec<AbsEvent>) -> Vec<TrackEvent<'static>> {
    abs.sort_by(|a, b| a.tick.cmp(&b.tick).then_with(|| a.priority.cmp(&b.priority)));
    let mut track = Vec::with_capacity(abs.len() + 1);
    let mut cursor = 0u64;
    for event in abs {
        let delta = event.tick.saturating_sub(cursor).min(0x0FFF_FFFF);
        track.push(TrackEvent {
            delta: u28::new(delta as u32),
            kind: event.kind,
        });
        cursor = event.tick;
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    track
}

#[cfg(test)]
mod tests {
    use super::*;
    use symi_lang::compile;

    fn export_source(source: &str, config: &MidiConfig) -> Result<Vec<u8>, ExportError> {
        let compilation = compile(source);
        assert!(
            compilation.diagnostics.iter().all(|d| !d.is_error()),
            "compile errors: {:?}",
            compilation.diagnostics
        );
        export(&compilation.events, &compilation.tempo, config)
    }

    fn count_events<F: Fn(&TrackEventKind) -> bool>(smf: &Smf, pred: F) -> usize {
        smf.tracks
            .iter()
            .flat_map(|track| track.iter())
            .filter(|event| pred(&event.kind))
            .count()
    }

    #[test]
    fn simple_scale_round_trips() {
        let bytes =
            export_source("(4/4)(120) C4,D4,E4,F4,\n", &MidiConfig::default()).unwrap();
        let smf = Smf::parse(&bytes).expect("generated bytes should be valid SMF");

        assert_eq!(smf.header.format, Format::Parallel);
        // tempo map track plus one note track
        assert_eq!(smf.tracks.len(), 2);
        assert!(count_events(&smf, |kind| matches!(
            kind,
            TrackEventKind::Meta(MetaMessage::Tempo(_))
        )) >= 1);
        assert!(count_events(&smf, |kind| matches!(
            kind,
            TrackEventKind::Meta(MetaMessage::TimeSignature(..))
        )) >= 1);
        assert_eq!(
            count_events(&smf, |kind| matches!(
                kind,
                TrackEventKind::Midi {
                    message: MidiMessage::NoteOn { .. },
                    ..
                }
            )),
            4
        );
        assert_eq!(
            count_events(&smf, |kind| matches!(
                kind,
                TrackEventKind::Midi {
                    message: MidiMessage::NoteOff { .. },
                    ..
                }
            )),
            4
        );
    }

    #[test]
    fn note_onsets_survive_the_round_trip() {
        let config = MidiConfig::default();
        let compilation = compile("(120) C4,D4,E4,F4,\n");
        let bytes = export(&compilation.events, &compilation.tempo, &config).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        // reconstruct absolute onset seconds from the note track
        let mpq = 60e6 / 120.0;
        let tpq = 480.0;
        let mut tick = 0u64;
        let mut onsets = Vec::new();
        for event in &smf.tracks[1] {
            tick += u64::from(event.delta.as_int());
            if let TrackEventKind::Midi {
                message: MidiMessage::NoteOn { .. },
                ..
            } = event.kind
            {
                onsets.push(tick as f64 * mpq / 1e6 / tpq);
            }
        }
        let expected: Vec<f64> = compilation
            .events
            .iter()
            .filter_map(|event| match event {
                Event::Note(note) => Some(note.start_sec),
                _ => None,
            })
            .collect();
        assert_eq!(onsets.len(), expected.len());
        for (actual, wanted) in onsets.iter().zip(expected.iter()) {
            assert!(
                (actual - wanted).abs() <= config.time_tolerance_seconds,
                "onset {} vs {}",
                actual,
                wanted
            );
        }
    }

    #[test]
    fn rpn_preamble_opens_every_note_track() {
        let bytes = export_source("C4,\n", &MidiConfig::default()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        let controllers: Vec<(u8, u8)> = smf.tracks[1]
            .iter()
            .filter_map(|event| match event.kind {
                TrackEventKind::Midi {
                    message: MidiMessage::Controller { controller, value },
                    ..
                } => Some((controller.as_int(), value.as_int())),
                _ => None,
            })
            .collect();
        assert_eq!(controllers, vec![(101, 0), (100, 0), (6, 2), (38, 0)]);
    }

    #[test]
    fn microtonal_chord_splits_channels() {
        // C4 and a quarter-tone away from it cannot share a bend value
        let bytes = export_source("C4:50c,\n", &MidiConfig::default()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.tracks.len(), 3);

        let channels: Vec<u8> = smf
            .tracks
            .iter()
            .skip(1)
            .flat_map(|track| track.iter())
            .filter_map(|event| match event.kind {
                TrackEventKind::Midi { channel, message } => match message {
                    MidiMessage::NoteOn { .. } => Some(channel.as_int()),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(channels.len(), 2);
        assert_ne!(channels[0], channels[1]);
    }

    #[test]
    fn agreeing_pitches_share_a_channel() {
        // a plain twelve-tone chord needs no bend separation at all
        let bytes = export_source("C4:E4:G4,\n", &MidiConfig::default()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.tracks.len(), 2);
    }

    #[test]
    fn wide_glide_fails_bend_validation() {
        // a fifth cannot fit a +-2 semitone bend range
        let result = export_source("C4@G4\n", &MidiConfig::default());
        match result {
            Err(ExportError::BendOutOfRange { range: 2, .. }) => {}
            other => panic!("expected BendOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn narrow_glide_emits_a_bend_ramp() {
        let bytes = export_source("C4@D4,\n", &MidiConfig::default()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        let bends: Vec<u16> = smf
            .tracks
            .iter()
            .skip(1)
            .flat_map(|track| track.iter())
            .filter_map(|event| match event.kind {
                TrackEventKind::Midi {
                    message: MidiMessage::PitchBend { bend },
                    ..
                } => Some(bend.0.as_int()),
                _ => None,
            })
            .collect();
        assert!(bends.len() > 2, "expected a ramp, got {:?}", bends);
        assert_eq!(*bends.first().unwrap(), 8192);
        // the last ramp point reaches the +2 semitone ceiling
        assert_eq!(*bends.last().unwrap(), 16383);
        let mut sorted = bends.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, bends, "ramp must rise monotonically");
    }

    #[test]
    fn coarse_resolution_fails_time_tolerance() {
        let config = MidiConfig {
            ticks_per_quarter: 1,
            ..MidiConfig::default()
        };
        let result = export_source("(120) {8}C4,D4,\n", &config);
        match result {
            Err(ExportError::ToleranceExceeded { quantity, .. }) => {
                assert!(quantity.contains("onset"))
            }
            other => panic!("expected ToleranceExceeded, got {:?}", other),
        }
    }

    #[test]
    fn strict_pitch_tolerance_fails() {
        let config = MidiConfig {
            pitch_tolerance_cents: 1e-7,
            ..MidiConfig::default()
        };
        let result = export_source("1c,\n", &config);
        match result {
            Err(ExportError::ToleranceExceeded { quantity, .. }) => {
                assert!(quantity.contains("pitch"))
            }
            other => panic!("expected ToleranceExceeded, got {:?}", other),
        }
    }

    #[test]
    fn invalid_resolution_is_rejected() {
        let config = MidiConfig {
            ticks_per_quarter: 0,
            ..MidiConfig::default()
        };
        match export_source("C4,\n", &config) {
            Err(ExportError::InvalidResolution { tpq: 0 }) => {}
            other => panic!("expected InvalidResolution, got {:?}", other),
        }
    }

    #[test]
    fn tempo_changes_reach_the_meta_track() {
        let bytes = export_source("(60) C4,(120) D4,\n", &MidiConfig::default()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        let tempos: Vec<u32> = smf.tracks[0]
            .iter()
            .filter_map(|event| match event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(mpq)) => Some(mpq.as_int()),
                _ => None,
            })
            .collect();
        // the 60 bpm change collapses into the t=0 default, then 120
        assert_eq!(tempos, vec![1_000_000, 500_000]);
    }
}
