// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fatal handling for contextual errors: the process-wide category
//! registry, the register-wrap-format-write-exit convenience
//! ([`check_err`]), and panic escalation ([`panic_with`]).
//!
//! Two pieces of process-wide mutable state live here, each behind its own
//! lock: the category counters and the termination hook.  Termination is
//! injectable so tests can intercept the exit instead of ending the test
//! process.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use colored::Colorize;
use ctxerr_core::{BoxError, ContextualError, Details, as_contextual_error};
use ctxerr_format::Formatter;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io::{self, Write};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Category registry
// ---------------------------------------------------------------------------

/// Per-category error counts.  Empty on first use, process lifetime, no
/// teardown.
static ERROR_REGISTRY: Mutex<BTreeMap<String, u64>> = Mutex::new(BTreeMap::new());

/// Reserved bucket for errors without a usable category.
const UNKNOWN_BUCKET: &str = "unknown";

/// Count an observed error in its category bucket.
///
/// No-op on `None`.  An error whose chain carries a contextual error with a
/// non-empty category increments that category; anything else increments
/// the reserved `"unknown"` bucket.
pub fn register_error(err: Option<&(dyn StdError + 'static)>) {
    let Some(err) = err else { return };
    let bucket = as_contextual_error(err)
        .map(|ce| ce.category.as_str())
        .filter(|category| !category.is_empty())
        .unwrap_or(UNKNOWN_BUCKET)
        .to_string();
    let count = {
        let mut registry = ERROR_REGISTRY.lock().expect("error registry lock poisoned");
        let count = registry.entry(bucket.clone()).or_insert(0);
        *count += 1;
        *count
    };
    tracing::debug!(category = %bucket, count, "error registered");
}

/// A snapshot of the current per-category counts.
///
/// The returned map is an independent copy; mutating it never affects the
/// internal state.
pub fn error_registry() -> BTreeMap<String, u64> {
    let registry = ERROR_REGISTRY.lock().expect("error registry lock poisoned");
    registry.clone()
}

// ---------------------------------------------------------------------------
// Termination hook
// ---------------------------------------------------------------------------

/// Override for process termination, guarded by its own lock.
static EXIT_HOOK: Mutex<Option<Box<dyn FnMut(i32) + Send>>> = Mutex::new(None);

/// Install a termination hook.
///
/// While a hook is installed, [`check_err`] invokes it with the resolved
/// exit code and then returns normally instead of exiting the process.
pub fn set_exit_hook(hook: impl FnMut(i32) + Send + 'static) {
    let mut slot = EXIT_HOOK.lock().expect("exit hook lock poisoned");
    *slot = Some(Box::new(hook));
}

/// Remove an installed termination hook, restoring real process exit.
pub fn clear_exit_hook() {
    let mut slot = EXIT_HOOK.lock().expect("exit hook lock poisoned");
    *slot = None;
}

fn terminate(code: i32) {
    let mut slot = EXIT_HOOK.lock().expect("exit hook lock poisoned");
    if let Some(hook) = slot.as_mut() {
        hook(code);
        return;
    }
    drop(slot);
    std::process::exit(code);
}

// ---------------------------------------------------------------------------
// check_err
// ---------------------------------------------------------------------------

/// Configuration for [`check_err_with`], built in `with_*` style.
///
/// Every override replaces the default wholesale; in particular
/// [`CheckConfig::with_details`] swaps the whole map rather than merging.
pub struct CheckConfig {
    operation: String,
    category: String,
    message: String,
    details: Details,
    writer: Box<dyn Write + Send>,
    exit_code: i32,
    formatter: Formatter,
}

impl Default for CheckConfig {
    fn default() -> Self {
        let mut details = Details::new();
        details.insert("severity".into(), serde_json::json!("critical"));
        details.insert("location".into(), serde_json::json!("checkErr"));
        Self {
            operation: "check error".into(),
            category: "runtime_error".into(),
            message: "An error occurred during execution".into(),
            details,
            writer: Box::new(io::stderr()),
            exit_code: 1,
            formatter: ctxerr_format::annotated,
        }
    }
}

impl CheckConfig {
    /// Override the operation the fatal wrapper reports.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Override the category the fatal wrapper reports.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Override the user-facing message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Replace the detail map wholesale.
    pub fn with_details(mut self, details: Details) -> Self {
        self.details = details;
        self
    }

    /// Redirect the rendered output (defaults to standard error).
    pub fn with_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.writer = Box::new(writer);
        self
    }

    /// Set a custom exit code (defaults to 1).
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Choose the rendering strategy (defaults to the annotated formatter).
    pub fn with_formatter(mut self, formatter: Formatter) -> Self {
        self.formatter = formatter;
        self
    }
}

/// Register, wrap, format, write, and terminate on a fatal error, using the
/// default configuration.
///
/// No-op on `None`.
pub fn check_err(err: Option<BoxError>) {
    check_err_with(err, CheckConfig::default());
}

/// [`check_err`] with caller-supplied configuration.
///
/// The error is counted in the registry, wrapped into a fresh categorized
/// [`ContextualError`] carrying the configured fields, rendered with the
/// configured formatter, written to the configured sink, and the process is
/// terminated with the configured exit code (or the installed hook is
/// invoked instead).
pub fn check_err_with(err: Option<BoxError>, cfg: CheckConfig) {
    let Some(err) = err else { return };
    {
        let observed: &(dyn StdError + 'static) = err.as_ref();
        register_error(Some(observed));
    }

    let CheckConfig {
        operation,
        category,
        message,
        details,
        mut writer,
        exit_code,
        formatter,
    } = cfg;
    let wrapped =
        ContextualError::categorized(operation, category, message, Some(err), Some(details));

    tracing::error!(
        operation = %wrapped.operation,
        category = %wrapped.category,
        exit_code,
        "fatal error"
    );
    let _ = writeln!(writer, "{}", formatter(&wrapped));

    terminate(exit_code);
}

// ---------------------------------------------------------------------------
// Panic escalation
// ---------------------------------------------------------------------------

/// Write the panic banner to standard error and unwind with a fresh
/// uncategorized [`ContextualError`] as payload.
///
/// Meant for programmer-error conditions: only an explicitly intercepting
/// caller (`catch_unwind` plus a payload downcast) can continue execution
/// and inspect the original error.
pub fn panic_with(operation: &str, message: &str) -> ! {
    let err = ContextualError::new(operation, message, None, None);
    eprintln!("{}", ctxerr_format::panic_message(operation, message));
    std::panic::panic_any(err)
}

// ---------------------------------------------------------------------------
// Not-found logging collaborator
// ---------------------------------------------------------------------------

/// The resource-missing handler capability: given a data address, report
/// whether the caller should treat the resource as present, or fail.
pub type NotFoundAction = Box<dyn FnMut(&str) -> Result<bool, BoxError> + Send>;

const DEFAULT_NOT_FOUND_TEMPLATE: &str =
    "Warning: Data address '{address}' not found. Context: {context}";

/// Builder for a [`NotFoundAction`] that logs a warning and reports the
/// resource as absent.
///
/// The template may reference `{address}` and `{context}`; output goes to
/// standard error unless redirected.
pub struct NotFoundLog {
    context: String,
    template: String,
    writer: Box<dyn Write + Send>,
}

impl NotFoundLog {
    /// Create a logger with the given context message and defaults.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            template: DEFAULT_NOT_FOUND_TEMPLATE.into(),
            writer: Box::new(io::stderr()),
        }
    }

    /// Redirect the warning output.
    pub fn with_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.writer = Box::new(writer);
        self
    }

    /// Override the warning template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Finish the builder, yielding the action itself.
    pub fn into_action(self) -> NotFoundAction {
        let NotFoundLog {
            context,
            template,
            mut writer,
        } = self;
        Box::new(move |address: &str| {
            let msg = template
                .replace("{address}", address)
                .replace("{context}", &context);
            let _ = writeln!(writer, "{}", msg.yellow());
            Ok(false)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ctxerr_core::CollectingError;
    use serial_test::serial;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn plain() -> BoxError {
        Box::new(io::Error::other("boom"))
    }

    fn no_color() {
        colored::control::set_override(false);
    }

    /// Install a hook that records the exit code; returns the shared slot.
    fn capture_exit() -> Arc<AtomicI32> {
        let code = Arc::new(AtomicI32::new(-1));
        let slot = Arc::clone(&code);
        set_exit_hook(move |c| slot.store(c, Ordering::SeqCst));
        code
    }

    // -- Registry --------------------------------------------------------

    #[test]
    #[serial]
    fn register_none_is_a_noop() {
        let before = error_registry();
        register_error(None);
        assert_eq!(error_registry(), before);
    }

    #[test]
    #[serial]
    fn register_plain_error_counts_unknown() {
        let before = error_registry().get(UNKNOWN_BUCKET).copied().unwrap_or(0);
        let err = plain();
        register_error(Some(err.as_ref()));
        let after = error_registry().get(UNKNOWN_BUCKET).copied().unwrap_or(0);
        assert_eq!(after, before + 1);
    }

    #[test]
    #[serial]
    fn register_categorized_error_counts_its_bucket() {
        let err = ContextualError::categorized("op", "mycat", "msg", Some(plain()), None);
        let before = error_registry().get("mycat").copied().unwrap_or(0);
        register_error(Some(&err));
        let after = error_registry().get("mycat").copied().unwrap_or(0);
        assert_eq!(after, before + 1);
    }

    #[test]
    #[serial]
    fn uncategorized_contextual_error_counts_unknown() {
        let err = ContextualError::new("op", "msg", None, None);
        let before = error_registry().get(UNKNOWN_BUCKET).copied().unwrap_or(0);
        register_error(Some(&err));
        let after = error_registry().get(UNKNOWN_BUCKET).copied().unwrap_or(0);
        assert_eq!(after, before + 1);
    }

    #[test]
    #[serial]
    fn registry_snapshot_is_independent() {
        let err = ContextualError::categorized("op", "snapcat", "msg", None, None);
        register_error(Some(&err));
        let mut snapshot = error_registry();
        snapshot.insert("snapcat".into(), 9999);
        let fresh = error_registry();
        assert_ne!(fresh.get("snapcat").copied(), Some(9999));
    }

    // -- check_err -------------------------------------------------------

    #[test]
    #[serial]
    fn check_err_none_is_a_noop() {
        let before = error_registry();
        let code = capture_exit();
        check_err(None);
        clear_exit_hook();
        assert_eq!(code.load(Ordering::SeqCst), -1, "termination not expected");
        assert_eq!(error_registry(), before);
    }

    #[test]
    #[serial]
    fn check_err_defaults() {
        no_color();
        let out = CollectingError::new();
        let code = capture_exit();
        check_err_with(
            Some(plain()),
            CheckConfig::default().with_writer(out.clone()),
        );
        clear_exit_hook();

        assert_eq!(code.load(Ordering::SeqCst), 1);
        let rendered = out.contents();
        assert!(rendered.contains("boom"));
        assert!(rendered.contains("check error"));
        assert!(rendered.contains("runtime_error"));
        assert!(rendered.contains("severity"));
        assert!(rendered.contains("critical"));
    }

    #[test]
    #[serial]
    fn check_err_overrides_replace_wholesale() {
        no_color();
        let out = CollectingError::new();
        let code = capture_exit();
        let mut details = Details::new();
        details.insert("path".into(), serde_json::json!("/etc/app.cfg"));
        check_err_with(
            Some(plain()),
            CheckConfig::default()
                .with_operation("load-conf")
                .with_category("cfg_err")
                .with_message("couldn't load config")
                .with_details(details)
                .with_exit_code(7)
                .with_formatter(ctxerr_format::plain)
                .with_writer(out.clone()),
        );
        clear_exit_hook();

        assert_eq!(code.load(Ordering::SeqCst), 7);
        let rendered = out.contents();
        for expected in [
            "load-conf",
            "cfg_err",
            "couldn't load config",
            "path",
            "/etc/app.cfg",
        ] {
            assert!(rendered.contains(expected), "missing {expected:?}");
        }
        // Wholesale replacement: the default details are gone.
        assert!(!rendered.contains("severity"));
    }

    #[test]
    #[serial]
    fn check_err_counts_the_original_category() {
        let out = CollectingError::new();
        let _code = capture_exit();
        let err = ContextualError::categorized("op", "disk_error", "m", None, None);
        let before = error_registry().get("disk_error").copied().unwrap_or(0);
        check_err_with(
            Some(Box::new(err)),
            CheckConfig::default().with_writer(out.clone()),
        );
        clear_exit_hook();
        let after = error_registry().get("disk_error").copied().unwrap_or(0);
        assert_eq!(after, before + 1);
    }

    // -- panic_with ------------------------------------------------------

    #[test]
    #[serial]
    fn panic_with_carries_the_error_as_payload() {
        std::panic::set_hook(Box::new(|_| {}));
        let result = std::panic::catch_unwind(|| panic_with("init", "missing handler"));
        let _ = std::panic::take_hook();

        let payload = result.expect_err("unwind expected");
        let err = payload
            .downcast::<ContextualError>()
            .expect("contextual error payload expected");
        assert_eq!(err.operation, "init");
        assert_eq!(err.message, "missing handler");
        assert!(err.cause.is_none());
        assert!(err.details.is_empty());
        assert!(err.has_stack());
    }

    // -- NotFoundLog -----------------------------------------------------

    #[test]
    fn not_found_action_logs_and_reports_absent() {
        no_color();
        let out = CollectingError::new();
        let mut action = NotFoundLog::new("while resolving imports")
            .with_writer(out.clone())
            .into_action();
        let found = action("config/unit.toml").unwrap();
        assert!(!found);
        let logged = out.contents();
        assert!(logged.contains("config/unit.toml"));
        assert!(logged.contains("while resolving imports"));
        assert!(logged.starts_with("Warning:"));
    }

    #[test]
    fn not_found_action_custom_template() {
        no_color();
        let out = CollectingError::new();
        let mut action = NotFoundLog::new("ctx")
            .with_writer(out.clone())
            .with_template("missing {address} ({context})")
            .into_action();
        action("a/b").unwrap();
        assert_eq!(out.contents(), "missing a/b (ctx)\n");
    }
}
