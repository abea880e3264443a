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

//! `symic` - the command line driver: compiles a score, reports
//! diagnostics with source highlights, and optionally writes a
//! Standard MIDI File.

use std::io;
use std::path::PathBuf;

use structopt::StructOpt;

use symi::MidiConfig;
use symi_lang::diag::Severity;
use symi_lang::line_map::LineMap;
use symi_lang::resolve::Event;

#[derive(Debug, StructOpt)]
#[structopt(name = "symic", about = "Compiling symi scores into MIDI")]
struct Opt {
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    /// The score to compile.
    #[structopt(parse(from_os_str))]
    source: PathBuf,

    /// Print the token stream.
    #[structopt(long)]
    tokens: bool,

    /// Print the resolved event list.
    #[structopt(long)]
    events: bool,

    /// Write a Standard MIDI File to this path.
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,

    /// Pitch bend range configured via RPN 0,0, in semitones.
    #[structopt(long, default_value = "2")]
    bend_range: u16,

    /// MIDI resolution in ticks per quarter note.
    #[structopt(long, default_value = "480")]
    ticks_per_quarter: u32,

    /// Maximum onset drift introduced by tick rounding, in seconds.
    #[structopt(long, default_value = "0.0001")]
    time_tolerance: f64,

    /// Maximum pitch drift introduced by bend quantization, in cents.
    #[structopt(long, default_value = "3.0")]
    pitch_tolerance: f64,
}

fn main() -> io::Result<()> {
    let opt = Opt::from_args();

    let level = if opt.verbose {
        log::Level::Trace
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level).unwrap();

    let source = std::fs::read_to_string(&opt.source)?;
    let compilation = symi::compile(&source);

    let lines = LineMap::new(&source);
    let mut has_errors = false;
    for diag in &compilation.diagnostics {
        let start = lines.offset_to_pos(diag.span.start);
        let end = lines.offset_to_pos(diag.span.end);
        let rendered = format!(
            "{} ({})\n{}",
            diag.message,
            start,
            lines.highlight(start, end)
        );
        match diag.severity {
            Severity::Error => {
                has_errors = true;
                log::error!("{}", rendered);
            }
            Severity::Warning => log::warn!("{}", rendered),
        }
    }

    if opt.tokens {
        for token in &compilation.tokens {
            println!(
                "{} [{}, {}] {:?}",
                token.kind.name(),
                token.span.start,
                token.span.end,
                &source[token.span.clone()]
            );
        }
    }

    if opt.events {
        for event in &compilation.events {
            match event {
                Event::Note(note) => println!(
                    "note   {:10.3} Hz  at {:8.3}s for {:6.3}s  bar {} tick {}",
                    note.freq,
                    note.start_sec,
                    note.duration_sec,
                    note.start_bar,
                    note.start_tick
                ),
                Event::NewMeasure { bar, start_sec, .. } => {
                    println!("bar    {:10}     at {:8.3}s", bar, start_sec)
                }
                Event::BaseFrequencyDef {
                    freq, start_sec, ..
                } => println!("base   {:10.3} Hz  at {:8.3}s", freq, start_sec),
            }
        }
    }

    if let Some(output) = &opt.output {
        if has_errors {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "cannot export a score with compile errors",
            ));
        }
        let config = MidiConfig {
            pitch_bend_range_semitones: opt.bend_range,
            ticks_per_quarter: opt.ticks_per_quarter,
            time_tolerance_seconds: opt.time_tolerance,
            pitch_tolerance_cents: opt.pitch_tolerance,
        };
        let file_id = opt.source.to_string_lossy();
        symi::session::SESSION
            .export_midi(&file_id, &source, &config, output)
            .map_err(|message| io::Error::new(io::ErrorKind::InvalidData, message))?;
        log::info!("wrote {}", output.display());
    }

    Ok(())
}
