//! Terminal resolver: shows both sides of a conflict as a per-field diff and
//! reads a one-letter choice.

use std::collections::BTreeSet;
use std::io::{BufRead, Write};

use super::resolve::{Conflict, Resolver, SameKeyChoice, SimilarChoice};
use crate::record::Record;

/// One line of a field-by-field comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldDiff {
    Same { name: String, value: String },
    Changed { name: String, local: String, remote: String },
    OnlyLocal { name: String, value: String },
    OnlyRemote { name: String, value: String },
}

/// Compare two records field by field, in field-name order.
pub fn field_diff(local: &Record, remote: &Record) -> Vec<FieldDiff> {
    let names: BTreeSet<&str> = local.field_names().chain(remote.field_names()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let name_owned = name.to_string();
            let line = match (local.get(name), remote.get(name)) {
                (Some(l), Some(r)) if l == r => FieldDiff::Same {
                    name: name_owned,
                    value: l.to_string(),
                },
                (Some(l), Some(r)) => FieldDiff::Changed {
                    name: name_owned,
                    local: l.to_string(),
                    remote: r.to_string(),
                },
                (Some(l), None) => FieldDiff::OnlyLocal {
                    name: name_owned,
                    value: l.to_string(),
                },
                (None, Some(r)) => FieldDiff::OnlyRemote {
                    name: name_owned,
                    value: r.to_string(),
                },
                (None, None) => return None,
            };
            Some(line)
        })
        .collect()
}

/// Render a diff: `-` lines are the server's, `+` lines are local.
pub fn render_diff(diff: &[FieldDiff]) -> String {
    let mut out = String::new();
    for line in diff {
        match line {
            FieldDiff::Same { name, value } => out.push_str(&format!("  {} = {}\n", name, value)),
            FieldDiff::Changed { name, local, remote } => {
                out.push_str(&format!("- {} = {}\n", name, remote));
                out.push_str(&format!("+ {} = {}\n", name, local));
            }
            FieldDiff::OnlyLocal { name, value } => out.push_str(&format!("+ {} = {}\n", name, value)),
            FieldDiff::OnlyRemote { name, value } => out.push_str(&format!("- {} = {}\n", name, value)),
        }
    }
    out
}

/// Resolver reading choices from `input` and writing prompts to `output`.
///
/// End of input aborts.
pub struct PromptResolver<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptResolver<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn show(&mut self, heading: &str, conflict: &Conflict) {
        let diff = render_diff(&field_diff(&conflict.local, &conflict.remote));
        let _ = writeln!(self.output, "\n{}", heading);
        let _ = writeln!(
            self.output,
            "local {} vs server {} (distance {})",
            conflict.local.id(),
            conflict.remote.id(),
            conflict.distance
        );
        let _ = write!(self.output, "{}", diff);
    }

    /// Ask until an answer in `choices` arrives; `None` on end of input.
    fn ask(&mut self, prompt: &str, choices: &[char]) -> Option<char> {
        loop {
            let _ = write!(self.output, "{} ", prompt);
            let _ = self.output.flush();

            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }

            let answer = line.trim().to_lowercase();
            let mut chars = answer.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                if choices.contains(&c) {
                    return Some(c);
                }
            }
            let _ = writeln!(self.output, "Please answer one of: {:?}", choices);
        }
    }
}

impl<R: BufRead, W: Write> Resolver for PromptResolver<R, W> {
    fn same_key(&mut self, conflict: &Conflict) -> SameKeyChoice {
        self.show("Same key, different content:", conflict);
        match self.ask(
            "[l]ocal over server, [s]erver over local, [i]gnore, [a]bort?",
            &['l', 's', 'i', 'a'],
        ) {
            Some('l') => SameKeyChoice::PushLocal,
            Some('s') => SameKeyChoice::PullRemote,
            Some('i') => SameKeyChoice::Ignore,
            _ => SameKeyChoice::Abort,
        }
    }

    fn similar(&mut self, conflict: &Conflict) -> SimilarChoice {
        self.show("Similar entry under another key:", conflict);
        match self.ask(
            "[m]ake a new server entry, [d]elete server entry, [r]emove local entry, [i]gnore, [a]bort?",
            &['m', 'd', 'r', 'i', 'a'],
        ) {
            Some('m') => SimilarChoice::CommitLocal,
            Some('d') => SimilarChoice::DeleteRemote,
            Some('r') => SimilarChoice::DeleteLocal,
            Some('i') => SimilarChoice::Ignore,
            _ => SimilarChoice::Abort,
        }
    }
}
