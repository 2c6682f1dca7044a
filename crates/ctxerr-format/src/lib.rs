// SPDX-License-Identifier: MIT OR Apache-2.0
//! Rendering strategies for [`ContextualError`].
//!
//! A [`Formatter`] is a first-class function value operating purely on the
//! error's data model; strategies are stateless and composable, chosen at
//! the call site rather than baked into the error type.  Styling is
//! cosmetic and carries no semantic contract.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use colored::Colorize;
use ctxerr_core::ContextualError;

/// A pure rendering function from error to text.
pub type Formatter = fn(&ContextualError) -> String;

/// The default rendering, identical to the error's `Display`.
pub fn plain(err: &ContextualError) -> String {
    err.to_string()
}

/// Machine-parseable JSON rendering.
///
/// Serialises every field, with the cause rendered as its error string
/// under `err` (never a nested object) and the stack as an ordered
/// sequence of frames.
pub fn json(err: &ContextualError) -> String {
    serde_json::to_string(err).unwrap_or_else(|e| format!("error formatting: {e}"))
}

/// Human-oriented rendering: one field per line with aligned keys.
///
/// Fields appear in fixed order: operation, message, err, the details
/// block, category, and the stack block.  Keys are padded to the widest
/// key, detail keys included.
pub fn annotated(err: &ContextualError) -> String {
    let cause = err.cause.as_ref().map(|c| c.to_string()).unwrap_or_default();
    let scalars = [
        ("operation", err.operation.as_str()),
        ("message", err.message.as_str()),
        ("err", cause.as_str()),
        ("category", err.category.as_str()),
    ];
    let width = scalars
        .iter()
        .map(|(key, _)| key.len())
        .chain(err.details.keys().map(String::len))
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for (key, value) in scalars.iter().copied().take(3) {
        push_field(&mut out, "", key, value, width, true);
    }

    out.push_str(&format!("{}\n", "details".yellow()));
    for (key, value) in &err.details {
        push_field(&mut out, "  ", key, &value.to_string(), width, false);
    }
    out.push('\n');

    let (key, value) = scalars[3];
    push_field(&mut out, "", key, value, width, true);

    out.push_str(&format!("{}\n", "stack".yellow()));
    for frame in &err.stack {
        let function = format!("{}()", frame.function).magenta();
        let location = format!(" {}:{}", frame.file, frame.line).dimmed();
        out.push_str(&format!("  {function}{location}\n"));
    }
    out
}

fn push_field(out: &mut String, indent: &str, key: &str, value: &str, width: usize, top: bool) {
    let padded = format!("{indent}{key:<width$}");
    let padded = if top { padded.yellow() } else { padded.white() };
    out.push_str(&format!("{} {},\n", padded, value.red()));
}

/// The `Display` rendering with an `ERROR:` prefix, in red.
pub fn simple_colored(err: &ContextualError) -> String {
    format!("ERROR: {err}").red().to_string()
}

/// The banner written by the abort path: `Panic [<operation>]: <message>`.
pub fn panic_message(operation: &str, message: &str) -> String {
    format!("Panic [{operation}]: {message}").red().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
