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

//! Per-open-file cache of compiler artifacts.
//!
//! Every `file_update` rebuilds the full pipeline for that file and
//! swaps in an immutable snapshot; readers clone out of the snapshot
//! under a shared lock. Rebuilds for distinct files may run in
//! parallel. Rebuilds for the same file are last-writer-wins by a
//! monotone version, so a slow rebuild can never clobber a newer one.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use log::debug;
use parking_lot::RwLock;
use serde::Serialize;

use symi_lang::diag::{Diagnostic, Severity};
use symi_lang::lexer::Token;
use symi_lang::resolve::{Event, TempoMap};
use symi_midi::MidiConfig;

pub type FileId = String;

/// The immutable artifacts of one compiled source version.
#[derive(Debug)]
pub struct Snapshot {
    pub version: u64,
    pub source_hash: u64,
    pub tokens: Vec<Token>,
    pub diagnostics: Vec<Diagnostic>,
    pub events: Vec<Event>,
    pub tempo: TempoMap,
}

/// The process-wide store used by embedding hosts.
pub static SESSION: LazyLock<SessionStore> = LazyLock::new(SessionStore::new);

pub struct SessionStore {
    files: RwLock<BTreeMap<FileId, Arc<Snapshot>>>,
    versions: AtomicU64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore {
            files: RwLock::new(BTreeMap::new()),
            versions: AtomicU64::new(0),
        }
    }

    /// Install a new source version for a file. The pipeline runs
    /// outside any lock; the lock is only held to swap the snapshot.
    pub fn file_update(&self, file_id: &str, source: &str) {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let compilation = symi_lang::compile(source);
        let snapshot = Arc::new(Snapshot {
            version,
            source_hash: hash_source(source),
            tokens: compilation.tokens,
            diagnostics: compilation.diagnostics,
            events: compilation.events,
            tempo: compilation.tempo,
        });
        debug!(
            "rebuilt {}: {} tokens, {} events, {} diagnostics",
            file_id,
            snapshot.tokens.len(),
            snapshot.events.len(),
            snapshot.diagnostics.len()
        );

        let mut files = self.files.write();
        match files.get(file_id) {
            // an even newer rebuild already landed; drop this one
            Some(current) if current.version > version => {}
            _ => {
                files.insert(file_id.to_string(), snapshot);
            }
        }
    }

    pub fn file_close(&self, file_id: &str) {
        self.files.write().remove(file_id);
    }

    pub fn snapshot(&self, file_id: &str) -> Option<Arc<Snapshot>> {
        self.files.read().get(file_id).cloned()
    }

    /// Hash of the installed source, for stale-read detection.
    pub fn source_hash(&self, file_id: &str) -> Option<u64> {
        self.snapshot(file_id).map(|s| s.source_hash)
    }

    pub fn get_tokens(&self, file_id: &str) -> Vec<TokenView> {
        match self.snapshot(file_id) {
            Some(snapshot) => snapshot
                .tokens
                .iter()
                .map(|token| {
                    (
                        token.kind.name(),
                        token.span.start as u32,
                        token.span.end as u32,
                    )
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get_diagnostics(&self, file_id: &str) -> Vec<DiagnosticView> {
        match self.snapshot(file_id) {
            Some(snapshot) => snapshot
                .diagnostics
                .iter()
                .map(|diag| DiagnosticView {
                    severity: diag.severity.name(),
                    message: diag.message.clone(),
                    from: diag.span.start as u32,
                    to: diag.span.end as u32,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get_events(&self, file_id: &str) -> Vec<EventView> {
        match self.snapshot(file_id) {
            Some(snapshot) => snapshot.events.iter().map(EventView::from_event).collect(),
            None => Vec::new(),
        }
    }

    /// Run the full pipeline plus emitter validation without writing
    /// anything.
    pub fn validate_midi_export(
        &self,
        file_id: &str,
        source: &str,
        config: &MidiConfig,
    ) -> Result<(), String> {
        self.render_midi(file_id, source, config).map(|_| ())
    }

    /// Export to a Standard MIDI File. The bytes are fully serialized
    /// before anything touches the disk, then written to a sibling
    /// temp file and atomically renamed into place, so a failed export
    /// never leaves a partial file.
    pub fn export_midi(
        &self,
        file_id: &str,
        source: &str,
        config: &MidiConfig,
        target_path: &Path,
    ) -> Result<(), String> {
        let bytes = self.render_midi(file_id, source, config)?;
        let temp_path = sibling_temp_path(target_path);
        std::fs::write(&temp_path, &bytes).map_err(|e| format!("write failed: {}", e))?;
        std::fs::rename(&temp_path, target_path).map_err(|e| format!("rename failed: {}", e))?;
        debug!("exported {} bytes to {}", bytes.len(), target_path.display());
        Ok(())
    }

    fn render_midi(
        &self,
        file_id: &str,
        source: &str,
        config: &MidiConfig,
    ) -> Result<Vec<u8>, String> {
        self.file_update(file_id, source);
        let snapshot = self
            .snapshot(file_id)
            .ok_or_else(|| "file not found".to_string())?;

        if let Some(diag) = snapshot
            .diagnostics
            .iter()
            .find(|d| d.severity == Severity::Error)
        {
            return Err(format!("compile error: {}", diag.message));
        }

        symi_midi::export(&snapshot.events, &snapshot.tempo, config)
            .map_err(|e| format!("midi export failed: {}", e))
    }
}

fn hash_source(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

fn sibling_temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

// ==================== wire shapes ====================

/// `(kind name, from, to)`, the shape editors consume for highlighting.
pub type TokenView = (&'static str, u32, u32);

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticView {
    pub severity: &'static str,
    pub message: String,
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventView {
    pub r#type: &'static str,
    pub freq: f64,
    pub start_sec: f64,
    pub start_bar: u32,
    pub start_tick: (i64, i64),
    pub duration_sec: f64,
    pub duration_tick: (i64, i64),
    pub span_from: u32,
    pub span_to: u32,
    pub span_invoked_from: Option<u32>,
    pub span_invoked_to: Option<u32>,
    pub pitch_ratio: f64,
}

impl EventView {
    fn from_event(event: &Event) -> Self {
        match event {
            Event::Note(note) => EventView {
                r#type: "Note",
                freq: note.freq,
                start_sec: note.start_sec,
                start_bar: note.start_bar,
                start_tick: (note.start_tick.numerator(), note.start_tick.denominator()),
                duration_sec: note.duration_sec,
                duration_tick: (
                    note.duration_tick.numerator(),
                    note.duration_tick.denominator(),
                ),
                span_from: note.span.start as u32,
                span_to: note.span.end as u32,
                span_invoked_from: note.invoked_span.as_ref().map(|s| s.start as u32),
                span_invoked_to: note.invoked_span.as_ref().map(|s| s.end as u32),
                pitch_ratio: note.pitch_ratio,
            },
            Event::NewMeasure {
                bar,
                start_sec,
                span,
            } => EventView {
                r#type: "NewMeasure",
                freq: 0.0,
                start_sec: *start_sec,
                start_bar: *bar,
                start_tick: (0, 1),
                duration_sec: 0.0,
                duration_tick: (0, 1),
                span_from: span.start as u32,
                span_to: span.end as u32,
                span_invoked_from: None,
                span_invoked_to: None,
                pitch_ratio: 0.0,
            },
            Event::BaseFrequencyDef {
                freq,
                start_sec,
                span,
            } => EventView {
                r#type: "BaseFrequencyDef",
                freq: *freq,
                start_sec: *start_sec,
                start_bar: 0,
                start_tick: (0, 1),
                duration_sec: 0.0,
                duration_tick: (0, 1),
                span_from: span.start as u32,
                span_to: span.end as u32,
                span_invoked_from: None,
                span_invoked_to: None,
                pitch_ratio: 0.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_query() {
        let store = SessionStore::new();
        store.file_update("a.symi", "C4,D4,\n");

        let tokens = store.get_tokens("a.symi");
        assert!(!tokens.is_empty());
        assert_eq!(tokens[0].0, "PitchSpellOctave");

        let events = store.get_events("a.symi");
        let notes = events.iter().filter(|e| e.r#type == "Note").count();
        assert_eq!(notes, 2);

        assert!(store.get_diagnostics("a.symi").is_empty());
    }

    #[test]
    fn close_drops_the_entry() {
        let store = SessionStore::new();
        store.file_update("a.symi", "C4,\n");
        assert!(store.snapshot("a.symi").is_some());
        store.file_close("a.symi");
        assert!(store.snapshot("a.symi").is_none());
        assert!(store.get_tokens("a.symi").is_empty());
    }

    #[test]
    fn source_hash_tracks_the_content() {
        let store = SessionStore::new();
        store.file_update("a.symi", "C4,\n");
        let first = store.source_hash("a.symi").unwrap();
        store.file_update("a.symi", "C4,\n");
        assert_eq!(store.source_hash("a.symi").unwrap(), first);
        store.file_update("a.symi", "D4,\n");
        assert_ne!(store.source_hash("a.symi").unwrap(), first);
    }

    #[test]
    fn versions_are_monotone() {
        let store = SessionStore::new();
        store.file_update("a.symi", "C4,\n");
        let v1 = store.snapshot("a.symi").unwrap().version;
        store.file_update("a.symi", "D4,\n");
        let v2 = store.snapshot("a.symi").unwrap().version;
        assert!(v2 > v1);
    }

    #[test]
    fn files_rebuild_independently() {
        let store = Arc::new(SessionStore::new());
        let mut handles = Vec::new();
        for index in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let id = format!("file-{}.symi", index);
                for _ in 0..16 {
                    store.file_update(&id, "(120) C4,D4,E4,F4,\n");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        for index in 0..4 {
            let id = format!("file-{}.symi", index);
            assert_eq!(
                store
                    .get_events(&id)
                    .iter()
                    .filter(|e| e.r#type == "Note")
                    .count(),
                4
            );
        }
    }

    #[test]
    fn diagnostics_surface_through_the_store() {
        let store = SessionStore::new();
        store.file_update("a.symi", "nope,\n");
        let diags = store.get_diagnostics("a.symi");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, "Error");
        assert!(diags[0].message.contains("undefined macro"));
    }

    #[test]
    fn validate_rejects_what_export_rejects() {
        let store = SessionStore::new();
        let config = MidiConfig::default();
        // a fifth-wide glide cannot fit a 2-semitone bend range
        let result = store.validate_midi_export("a.symi", "C4@G4\n", &config);
        assert!(result.unwrap_err().contains("bend"));

        assert!(store
            .validate_midi_export("a.symi", "C4,D4,\n", &config)
            .is_ok());
    }

    #[test]
    fn export_writes_the_file_atomically() {
        let store = SessionStore::new();
        let config = MidiConfig::default();
        let dir = std::env::temp_dir();
        let target = dir.join("symi-session-test.mid");
        let _ = std::fs::remove_file(&target);

        store
            .export_midi("a.symi", "(120) C4,E4,G4,\n", &config, &target)
            .unwrap();
        let bytes = std::fs::read(&target).unwrap();
        assert_eq!(&bytes[0..4], b"MThd");
        // the temp file is gone after the rename
        assert!(!sibling_temp_path(&target).exists());
        let _ = std::fs::remove_file(&target);
    }

    #[test]
    fn failed_export_writes_nothing() {
        let store = SessionStore::new();
        let config = MidiConfig::default();
        let dir = std::env::temp_dir();
        let target = dir.join("symi-session-test-failed.mid");
        let _ = std::fs::remove_file(&target);

        let result = store.export_midi("a.symi", "C4@G4\n", &config, &target);
        assert!(result.is_err());
        assert!(!target.exists());
        assert!(!sibling_temp_path(&target).exists());
    }
}
