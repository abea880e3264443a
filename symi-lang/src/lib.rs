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

pub mod ast;
pub mod diag;
pub mod expand;
pub mod lexer;
pub mod line_map;
pub mod parser;
pub mod resolve;

use lexer::Token;

/// All artifacts produced by one run of the pipeline over a source buffer.
///
/// The pipeline never fails: problems surface as [`diag::Diagnostic`]s and
/// the affected constructs degrade to neutral defaults. Running it twice
/// over the same source yields identical artifacts.
#[derive(Debug)]
pub struct Compilation {
    pub tokens: Vec<Token>,
    pub root: ast::Node<ast::Root>,
    pub diagnostics: Vec<diag::Diagnostic>,
    pub events: Vec<resolve::Event>,
    pub tempo: resolve::TempoMap,
}

/// Run lexer, parser, macro expander and time resolver over a source buffer.
pub fn compile(source: &str) -> Compilation {
    let parsed = parser::parse(source);
    let mut diagnostics = parsed.diagnostics;
    let (root, expand_diags) = expand::expand(parsed.root);
    diagnostics.extend(expand_diags);
    let resolved = resolve::resolve(&root);
    diagnostics.extend(resolved.diagnostics);
    Compilation {
        tokens: parsed.tokens,
        root,
        diagnostics,
        events: resolved.events,
        tempo: resolved.tempo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Severity;

    #[test]
    fn pipeline_is_deterministic() {
        let source = "(4/4)(120) C4,D4,E4,F4,\n";
        let a = compile(source);
        let b = compile(source);
        assert_eq!(format!("{:?}", a.events), format!("{:?}", b.events));
        assert_eq!(a.tokens.len(), b.tokens.len());
    }

    #[test]
    fn clean_source_has_no_diagnostics() {
        let c = compile("(4/4)(120) C4,D4,E4,F4,\n");
        assert!(
            c.diagnostics.is_empty(),
            "unexpected diagnostics: {:?}",
            c.diagnostics
        );
    }

    #[test]
    fn broken_source_still_produces_artifacts() {
        let c = compile("C4,??,D4,\n");
        assert!(c.diagnostics.iter().any(|d| d.severity == Severity::Error));
        assert!(c.events.iter().any(|e| matches!(e, resolve::Event::Note(_))));
    }
}
