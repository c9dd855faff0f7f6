//! Outward interfaces to the presentation collaborator.
//!
//! The core consumes these traits and never implements them; the binary (or
//! a test double) supplies the concrete prompt, notification, and connect
//! surfaces.

use std::future::Future;
use std::pin::Pin;

/// Future returned by asynchronous collaborator calls.
pub type UiFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One selectable entry in a choice prompt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Choice {
    /// Primary label shown to the operator.
    pub label: String,
    /// Secondary descriptive line, when useful.
    pub detail: Option<String>,
}

impl Choice {
    /// Creates a choice with a label only.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            detail: None,
        }
    }

    /// Attaches a detail line.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Result of a single interactive prompt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Answer<T> {
    /// The operator produced a value.
    Value(T),
    /// The operator asked to return to the previous step.
    Back,
    /// The interaction surface was dismissed.
    Dismissed,
}

/// Handle for an indeterminate progress surface.
///
/// Dropping the handle without calling [`ProgressHandle::finish`] leaves the
/// surface to the implementation's own cleanup.
pub trait ProgressHandle: Send {
    /// Updates the message shown next to the progress indicator.
    fn set_message(&self, message: &str);
    /// Removes the progress surface.
    fn finish(&self);
}

/// Prompt and notification surface consumed by the core.
pub trait UserInterface {
    /// Presents a list of options; resolves with the selected index, a
    /// backward-navigation request, or a dismissal.
    fn pick<'a>(&'a self, prompt: &'a str, options: &'a [Choice]) -> UiFuture<'a, Answer<usize>>;

    /// Requests free-form text. The validator returns an inline error
    /// message for unacceptable input; implementations redisplay the prompt
    /// with that message instead of resolving.
    fn input<'a>(
        &'a self,
        prompt: &'a str,
        initial: Option<&'a str>,
        validate: &'a (dyn Fn(&str) -> Option<String> + Sync),
    ) -> UiFuture<'a, Answer<String>>;

    /// Asks a yes/no question; dismissal counts as `false`.
    fn confirm<'a>(&'a self, prompt: &'a str) -> UiFuture<'a, bool>;

    /// Opens an indeterminate progress surface titled `title`.
    fn begin_progress(&self, title: &str) -> Box<dyn ProgressHandle>;

    /// Shows an error with optional follow-up actions; resolves with the
    /// selected action index, if any.
    fn show_error<'a>(
        &'a self,
        message: &'a str,
        actions: &'a [&'a str],
    ) -> UiFuture<'a, Option<usize>>;

    /// Shows a warning with optional follow-up actions; resolves with the
    /// selected action index, if any.
    fn show_warning<'a>(
        &'a self,
        message: &'a str,
        actions: &'a [&'a str],
    ) -> UiFuture<'a, Option<usize>>;

    /// Shows an informational notice.
    fn show_info(&self, message: &str);

    /// Opens the settings surface so the operator can fix credentials.
    fn open_settings(&self);
}

impl<T: UserInterface + ?Sized> UserInterface for &T {
    fn pick<'a>(&'a self, prompt: &'a str, options: &'a [Choice]) -> UiFuture<'a, Answer<usize>> {
        (**self).pick(prompt, options)
    }

    fn input<'a>(
        &'a self,
        prompt: &'a str,
        initial: Option<&'a str>,
        validate: &'a (dyn Fn(&str) -> Option<String> + Sync),
    ) -> UiFuture<'a, Answer<String>> {
        (**self).input(prompt, initial, validate)
    }

    fn confirm<'a>(&'a self, prompt: &'a str) -> UiFuture<'a, bool> {
        (**self).confirm(prompt)
    }

    fn begin_progress(&self, title: &str) -> Box<dyn ProgressHandle> {
        (**self).begin_progress(title)
    }

    fn show_error<'a>(
        &'a self,
        message: &'a str,
        actions: &'a [&'a str],
    ) -> UiFuture<'a, Option<usize>> {
        (**self).show_error(message, actions)
    }

    fn show_warning<'a>(
        &'a self,
        message: &'a str,
        actions: &'a [&'a str],
    ) -> UiFuture<'a, Option<usize>> {
        (**self).show_warning(message, actions)
    }

    fn show_info(&self, message: &str) {
        (**self).show_info(message);
    }

    fn open_settings(&self) {
        (**self).open_settings();
    }
}

/// External collaborator that opens a remote session to an instance.
pub trait ConnectLauncher {
    /// Connects to `host`; `new_window` requests a fresh window or session
    /// rather than reusing the current one.
    fn connect(&self, host: &str, new_window: bool);
}

impl<T: ConnectLauncher + ?Sized> ConnectLauncher for &T {
    fn connect(&self, host: &str, new_window: bool) {
        (**self).connect(host, new_window);
    }
}
