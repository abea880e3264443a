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

//! Macro expansion: replaces every [`Atom::Call`] with the inlined body
//! of the definition it refers to.
//!
//! Definitions are lexically ordered; a call resolves to the most recent
//! definition strictly before it, so redefinitions shadow. Bodies are
//! expanded lazily at every call site, which keeps shadowing inside
//! bodies working by plain span comparison: the atoms of an inlined body
//! still carry their defining spans.

use crate::{
    ast::{Atom, Expansion, Line, Node, Root, SeqItem, Sequence},
    diag::Diagnostic,
};

pub fn expand(mut root: Node<Root>) -> (Node<Root>, Vec<Diagnostic>) {
    let mut expander = Expander {
        defs: Vec::new(),
        diagnostics: Vec::new(),
    };

    // Definitions keep their calls unexpanded; they are inlined per call
    // site below. The resolver ignores definition lines entirely.
    for line in &root.data.lines {
        if let Line::Def(def) = &line.data {
            expander.defs.push(DefRecord {
                name: def.name.data.clone(),
                position: def.name.span.start,
                relative: def.relative,
                voices: def.voices.clone(),
            });
        }
    }

    let mut stack = Vec::new();
    for line in &mut root.data.lines {
        match &mut line.data {
            Line::Def(_) => {}
            Line::Ghost(seq) | Line::Play(seq) => {
                expander.expand_sequence(seq, &mut stack);
                debug_assert!(stack.is_empty());
            }
        }
    }

    (root, expander.diagnostics)
}

struct DefRecord {
    name: String,
    /// Byte offset of the definition; calls only see definitions whose
    /// offset is strictly smaller than their own span start.
    position: usize,
    relative: bool,
    voices: Vec<Sequence>,
}

struct Expander {
    defs: Vec<DefRecord>,
    diagnostics: Vec<Diagnostic>,
}

impl Expander {
    fn expand_sequence(&mut self, seq: &mut Sequence, stack: &mut Vec<String>) {
        for item in &mut seq.items {
            if let SeqItem::Group(group) = &mut item.data {
                for voice in &mut group.voices {
                    let atoms = std::mem::take(&mut voice.atoms);
                    voice.atoms = atoms
                        .into_iter()
                        .filter_map(|atom| self.expand_atom(atom, stack))
                        .collect();
                }
            }
        }
    }

    fn expand_atom(&mut self, atom: Node<Atom>, stack: &mut Vec<String>) -> Option<Node<Atom>> {
        let name = match &atom.data {
            Atom::Call(name) => name.clone(),
            _ => return Some(atom),
        };
        let span = atom.span.clone();

        if stack.iter().any(|entry| entry == &name) {
            self.diagnostics.push(Diagnostic::error(
                format!("recursive macro invoked: {}", name),
                span,
            ));
            return None;
        }

        let def = self
            .defs
            .iter()
            .rev()
            .find(|def| def.name == name && def.position < span.start);
        let (relative, mut voices) = match def {
            Some(def) => (def.relative, def.voices.clone()),
            None => {
                self.diagnostics.push(Diagnostic::error(
                    format!("undefined macro invoked: {}", name),
                    span,
                ));
                return None;
            }
        };

        stack.push(name);
        for voice_seq in &mut voices {
            self.expand_sequence(voice_seq, stack);
        }
        stack.pop();

        Some(Node::new(
            span.clone(),
            Atom::Expanded(Expansion {
                relative,
                call_span: span,
                voices,
            }),
        ))
    }
}
