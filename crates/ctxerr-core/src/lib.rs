// SPDX-License-Identifier: MIT OR Apache-2.0
//! Contextual error value with cause chaining, categories, open key-value
//! details, and call-stack capture.
//!
//! [`ContextualError`] is the central type: it records the operation that
//! failed, a human-facing message, an optional underlying cause, a free-text
//! category used for counting and routing, arbitrary details, and the call
//! stack at the moment of construction.  [`wrap`] and [`propagate_err`]
//! enrich an existing error with new context while preserving the original
//! as the cause, so root-cause inspection always stays possible.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Aliases
// ---------------------------------------------------------------------------

/// A boxed error suitable for cause chaining across threads.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Open key-value metadata attached to an error.
///
/// A `BTreeMap` keeps key order deterministic, so rendered details are
/// reproducible across runs.
pub type Details = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Stack capture
// ---------------------------------------------------------------------------

/// One resolved call-stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Function identifier, possibly mangled.
    pub function: String,
    /// Source file path, empty when unavailable.
    pub file: String,
    /// Line number, `0` when unavailable.
    pub line: u32,
}

/// Upper bound on captured frames per error.
const MAX_FRAMES: usize = 32;

/// Capture and resolve the current call stack, innermost call first.
///
/// Called from every constructor; the snapshot is immutable afterwards and
/// independent of any later rendering.
pub fn capture_stack() -> Vec<Frame> {
    let bt = backtrace::Backtrace::new();
    let mut frames = Vec::new();
    'capture: for frame in bt.frames() {
        for symbol in frame.symbols() {
            let function = symbol
                .name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| String::from("<unresolved>"));
            let file = symbol
                .filename()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let line = symbol.lineno().unwrap_or(0);
            frames.push(Frame {
                function,
                file,
                line,
            });
            if frames.len() == MAX_FRAMES {
                break 'capture;
            }
        }
    }
    frames
}

// ---------------------------------------------------------------------------
// ContextualError
// ---------------------------------------------------------------------------

/// An error enriched with operation, message, cause, details, category, and
/// a call-stack snapshot.
///
/// The cause forms a singly-owned chain: each error uniquely owns its direct
/// cause, and the chain is walked iteratively via [`StdError::source`].
///
/// # Builder usage
///
/// ```
/// use ctxerr_core::ContextualError;
///
/// let err = ContextualError::categorized("read config", "io_error", "cannot open", None, None)
///     .with_detail("path", "/etc/app.toml")
///     .with_detail("attempt", 2);
/// ```
pub struct ContextualError {
    /// The logical action being performed when the failure occurred.
    pub operation: String,
    /// Human-facing explanation; may be empty.
    pub message: String,
    /// The wrapped underlying failure, if any.
    pub cause: Option<BoxError>,
    /// Open key-value metadata.
    pub details: Details,
    /// Classification tag; empty means uncategorized.
    pub category: String,
    /// Call stack captured at construction, immutable thereafter.
    pub stack: Vec<Frame>,
}

impl ContextualError {
    /// Create a fresh uncategorized error with the stack captured now.
    ///
    /// `details` is defensively defaulted to an empty map so downstream
    /// merging and formatting stay total.
    pub fn new(
        operation: impl Into<String>,
        message: impl Into<String>,
        cause: Option<BoxError>,
        details: Option<Details>,
    ) -> Self {
        Self::categorized(operation, "", message, cause, details)
    }

    /// Create a fresh error with a category set.
    pub fn categorized(
        operation: impl Into<String>,
        category: impl Into<String>,
        message: impl Into<String>,
        cause: Option<BoxError>,
        details: Option<Details>,
    ) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            cause,
            details: details.unwrap_or_default(),
            category: category.into(),
            stack: capture_stack(),
        }
    }

    /// Attach a key-value detail, overwriting any existing entry.
    ///
    /// The value is converted via [`serde_json::to_value`]; a value that
    /// fails to serialise keeps its key with a `null` value, so
    /// caller-supplied keys are never silently dropped.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.details.insert(key.into(), value);
        self
    }

    /// Whether a non-empty stack was captured.
    pub fn has_stack(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Render the captured stack, one frame per line as
    /// `"<function>\n\t<file>:<line>\n"`, innermost call first.
    ///
    /// An empty stack renders to the empty string.
    pub fn stack_trace(&self) -> String {
        let mut out = String::new();
        for frame in &self.stack {
            out.push_str(&frame.function);
            out.push_str("\n\t");
            out.push_str(&frame.file);
            out.push(':');
            out.push_str(&frame.line.to_string());
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for ContextualError {
    /// Deterministic rendering; the exact shape is load-bearing for
    /// substring-matching consumers.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation '{}' failed", self.operation)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(ref cause) = self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        if !self.details.is_empty() {
            // BTreeMap keys render in sorted order.
            if let Ok(details) = serde_json::to_string(&self.details) {
                write!(f, " (details: {details})")?;
            }
        }
        if !self.category.is_empty() {
            write!(f, " [category: {}]", self.category)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContextualError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ContextualError");
        d.field("operation", &self.operation);
        d.field("message", &self.message);
        if let Some(ref cause) = self.cause {
            d.field("cause", &cause.to_string());
        }
        if !self.details.is_empty() {
            d.field("details", &self.details);
        }
        if !self.category.is_empty() {
            d.field("category", &self.category);
        }
        d.field("frames", &self.stack.len());
        d.finish()
    }
}

impl StdError for ContextualError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Build an uncategorized [`ContextualError`] with a pre-rendered message.
///
/// ```
/// use ctxerr_core::errorf;
///
/// let err = errorf!("parse header", "bad magic {:#x} at offset {}", 0xdead_u32, 12);
/// assert_eq!(err.message, "bad magic 0xdead at offset 12");
/// ```
#[macro_export]
macro_rules! errorf {
    ($op:expr, $($arg:tt)*) => {
        $crate::ContextualError::new(
            $op,
            ::std::format!($($arg)*),
            ::std::option::Option::None,
            ::std::option::Option::None,
        )
    };
}

// ---------------------------------------------------------------------------
// Wrapping & propagation
// ---------------------------------------------------------------------------

/// Wrap an existing error with a new operation and message.
///
/// `None` in, `None` out: propagating "no error" is a no-op.  Otherwise the
/// result is a brand-new [`ContextualError`] with a freshly captured stack
/// and `err` as its cause.  Category and details are inherited unchanged
/// from the first [`ContextualError`] in the chain (empty when there is
/// none); `wrap` carries no new category or details of its own.
pub fn wrap(
    err: Option<BoxError>,
    operation: impl Into<String>,
    message: impl Into<String>,
) -> Option<BoxError> {
    let err = err?;
    let inherited = {
        let e: &(dyn StdError + 'static) = err.as_ref();
        as_contextual_error(e).map(|ce| (ce.category.clone(), ce.details.clone()))
    };
    let (category, details) = inherited.unwrap_or_default();
    Some(Box::new(ContextualError {
        operation: operation.into(),
        message: message.into(),
        cause: Some(err),
        details,
        category,
        stack: capture_stack(),
    }))
}

/// Wrap an existing error, merging inherited category and details with new
/// ones.
///
/// The additive counterpart to [`wrap`]: the explicit `category` overrides
/// the inherited one only when non-empty (empty means "keep inherited");
/// the final details start from a copy of the inherited map with every
/// caller-supplied pair overlaid, so new keys win on collision and
/// inherited keys survive otherwise.  The cause is `err` itself, not its
/// cause, so repeated propagation builds a chain.
pub fn propagate_err(
    operation: impl Into<String>,
    category: impl Into<String>,
    message: impl Into<String>,
    err: Option<BoxError>,
    details: Option<Details>,
) -> Option<BoxError> {
    let err = err?;
    let base = {
        let e: &(dyn StdError + 'static) = err.as_ref();
        as_contextual_error(e).map(|ce| (ce.category.clone(), ce.details.clone()))
    };
    let (base_category, mut merged) = base.unwrap_or_default();
    if let Some(new_details) = details {
        merged.extend(new_details);
    }
    let category = category.into();
    let category = if category.is_empty() {
        base_category
    } else {
        category
    };
    Some(Box::new(ContextualError {
        operation: operation.into(),
        message: message.into(),
        cause: Some(err),
        details: merged,
        category,
        stack: capture_stack(),
    }))
}

/// Attach a single key-value detail to an error.
///
/// If `err` is a [`ContextualError`], the detail is inserted in place and
/// the same value is returned; this is the one intentional exception to the
/// "wrap produces a new value" rule, meant as a lightweight annotation
/// rather than a re-contextualization.  A plain error is wrapped into a new
/// `ContextualError` with operation `"unknown"`, its own rendering as the
/// message, and the detail as the sole entry.
pub fn with_detail(mut err: BoxError, key: impl Into<String>, value: impl Serialize) -> BoxError {
    let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    if let Some(ce) = err.downcast_mut::<ContextualError>() {
        ce.details.insert(key.into(), value);
        return err;
    }
    let message = err.to_string();
    let mut details = Details::new();
    details.insert(key.into(), value);
    Box::new(ContextualError::new(
        "unknown",
        message,
        Some(err),
        Some(details),
    ))
}

/// Walk the cause chain to the final non-wrapping error.
///
/// Iterative, so deep chains cannot overflow the stack; a chain of one
/// returns the input unchanged.
pub fn root_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current
}

// ---------------------------------------------------------------------------
// Inspection helpers
// ---------------------------------------------------------------------------

/// Whether `err` or anything in its cause chain is a [`ContextualError`].
pub fn is_contextual_error(err: &(dyn StdError + 'static)) -> bool {
    as_contextual_error(err).is_some()
}

/// Locate the first [`ContextualError`] in the cause chain.
///
/// Foreign error types participate by exposing a `ContextualError` through
/// their [`StdError::source`] chain.
pub fn as_contextual_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a ContextualError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(ce) = e.downcast_ref::<ContextualError>() {
            return Some(ce);
        }
        current = e.source();
    }
    None
}

/// The operation of the first contextual error in the chain, if any.
pub fn operation<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a str> {
    as_contextual_error(err).map(|ce| ce.operation.as_str())
}

/// The user-facing message of the first contextual error in the chain.
pub fn user_message<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a str> {
    as_contextual_error(err).map(|ce| ce.message.as_str())
}

/// The category of the first contextual error in the chain, if any.
pub fn category<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a str> {
    as_contextual_error(err).map(|ce| ce.category.as_str())
}

/// Look up a single detail by key.
pub fn detail<'a>(err: &'a (dyn StdError + 'static), key: &str) -> Option<&'a serde_json::Value> {
    as_contextual_error(err).and_then(|ce| ce.details.get(key))
}

/// All details of the first contextual error in the chain.
///
/// Returns an empty map, never an absent one, when the chain carries no
/// contextual error.
pub fn all_details(err: &(dyn StdError + 'static)) -> Details {
    as_contextual_error(err)
        .map(|ce| ce.details.clone())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`ContextualError`].
///
/// The cause is emitted as its rendered string under `err` (empty when
/// absent), never as a nested object; this is the one wire-compatibility
/// surface other systems may depend on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualErrorDto {
    /// Operation that failed.
    pub operation: String,
    /// Human-facing message.
    pub message: String,
    /// Rendered cause string, empty when there is no cause.
    pub err: String,
    /// Key-value details.
    pub details: Details,
    /// Classification tag.
    pub category: String,
    /// Captured stack frames, in capture order.
    pub stack: Vec<Frame>,
}

impl From<&ContextualError> for ContextualErrorDto {
    fn from(e: &ContextualError) -> Self {
        Self {
            operation: e.operation.clone(),
            message: e.message.clone(),
            err: e.cause.as_ref().map(|c| c.to_string()).unwrap_or_default(),
            details: e.details.clone(),
            category: e.category.clone(),
            stack: e.stack.clone(),
        }
    }
}

impl Serialize for ContextualError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ContextualErrorDto::from(self).serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// CollectingError
// ---------------------------------------------------------------------------

/// An accumulating writer that also satisfies the error interface.
///
/// Writes land in an internal buffer behind the type's own lock, so a clone
/// handed to another thread stays safe for concurrent writes.  The error
/// rendering is the accumulated text.
#[derive(Debug, Clone, Default)]
pub struct CollectingError {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CollectingError {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// The accumulated contents as text (lossy on invalid UTF-8).
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().expect("collecting buffer lock poisoned");
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// A copy of the accumulated bytes; the internal buffer stays private.
    pub fn bytes(&self) -> Vec<u8> {
        let buf = self.buf.lock().expect("collecting buffer lock poisoned");
        buf.clone()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        let buf = self.buf.lock().expect("collecting buffer lock poisoned");
        buf.is_empty()
    }

    /// Clear the buffer, allowing reuse.
    pub fn reset(&self) {
        let mut buf = self.buf.lock().expect("collecting buffer lock poisoned");
        buf.clear();
    }
}

impl io::Write for CollectingError {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.buf.lock().expect("collecting buffer lock poisoned");
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Display for CollectingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.contents())
    }
}

impl StdError for CollectingError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
