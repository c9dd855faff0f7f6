//! Terminal implementations of the presentation collaborator traits.
//!
//! This is presentation glue only: prompts via `inquire`, indeterminate
//! progress via an `indicatif` spinner, and an `ssh`-spawning connect
//! launcher. All lifecycle logic stays in the library.

use std::io::{self, Write};
use std::process::Command;

use indicatif::{ProgressBar, ProgressStyle};
use inquire::InquireError;

use ephemera::{Answer, Choice, ConnectLauncher, ProgressHandle, UiFuture, UserInterface};

const BACK_LABEL: &str = "\u{2039} Back";
const DISMISS_LABEL: &str = "Dismiss";

/// Prompt surface backed by the interactive terminal.
#[derive(Clone, Copy, Debug)]
pub struct ConsoleUi;

impl ConsoleUi {
    fn select(prompt: &str, options: Vec<String>) -> Result<usize, InquireError> {
        inquire::Select::new(prompt, options)
            .raw_prompt()
            .map(|selection| selection.index)
    }

    fn render_option(choice: &Choice) -> String {
        match &choice.detail {
            Some(detail) => format!("{} \u{2014} {detail}", choice.label),
            None => choice.label.clone(),
        }
    }
}

impl UserInterface for ConsoleUi {
    fn pick<'a>(&'a self, prompt: &'a str, options: &'a [Choice]) -> UiFuture<'a, Answer<usize>> {
        Box::pin(async move {
            let mut rendered: Vec<String> = options.iter().map(Self::render_option).collect();
            rendered.push(String::from(BACK_LABEL));
            let back_index = rendered.len() - 1;
            match Self::select(prompt, rendered) {
                Ok(index) if index == back_index => Answer::Back,
                Ok(index) => Answer::Value(index),
                Err(_) => Answer::Dismissed,
            }
        })
    }

    fn input<'a>(
        &'a self,
        prompt: &'a str,
        initial: Option<&'a str>,
        validate: &'a (dyn Fn(&str) -> Option<String> + Sync),
    ) -> UiFuture<'a, Answer<String>> {
        Box::pin(async move {
            loop {
                let mut text = inquire::Text::new(prompt);
                if let Some(value) = initial {
                    text = text.with_initial_value(value);
                }
                match text.prompt() {
                    Ok(value) => match validate(&value) {
                        Some(message) => {
                            writeln!(io::stderr(), "{message}").ok();
                        }
                        None => return Answer::Value(value),
                    },
                    Err(_) => return Answer::Dismissed,
                }
            }
        })
    }

    fn confirm<'a>(&'a self, prompt: &'a str) -> UiFuture<'a, bool> {
        Box::pin(async move {
            inquire::Confirm::new(prompt)
                .with_default(false)
                .prompt()
                .unwrap_or(false)
        })
    }

    fn begin_progress(&self, title: &str) -> Box<dyn ProgressHandle> {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            bar.set_style(style);
        }
        bar.set_message(title.to_owned());
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Box::new(Spinner { bar, title: title.to_owned() })
    }

    fn show_error<'a>(
        &'a self,
        message: &'a str,
        actions: &'a [&'a str],
    ) -> UiFuture<'a, Option<usize>> {
        Box::pin(async move {
            writeln!(io::stderr(), "error: {message}").ok();
            offer_actions(actions)
        })
    }

    fn show_warning<'a>(
        &'a self,
        message: &'a str,
        actions: &'a [&'a str],
    ) -> UiFuture<'a, Option<usize>> {
        Box::pin(async move {
            writeln!(io::stderr(), "warning: {message}").ok();
            offer_actions(actions)
        })
    }

    fn show_info(&self, message: &str) {
        writeln!(io::stdout(), "{message}").ok();
    }

    fn open_settings(&self) {
        writeln!(
            io::stdout(),
            "configure credentials via EPHEMERA_API_TOKEN (or EPHEMERA_CLIENT_ID and \
             EPHEMERA_SECRET), or the corresponding keys in ephemera.toml"
        )
        .ok();
    }
}

fn offer_actions(actions: &[&str]) -> Option<usize> {
    if actions.is_empty() {
        return None;
    }
    let mut rendered: Vec<String> = actions.iter().map(|&action| action.to_owned()).collect();
    rendered.push(String::from(DISMISS_LABEL));
    let dismiss_index = rendered.len() - 1;
    match ConsoleUi::select("How do you want to proceed?", rendered) {
        Ok(index) if index == dismiss_index => None,
        Ok(index) => Some(index),
        Err(_) => None,
    }
}

struct Spinner {
    bar: ProgressBar,
    title: String,
}

impl ProgressHandle for Spinner {
    fn set_message(&self, message: &str) {
        self.bar.set_message(format!("{}: {message}", self.title));
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Connect launcher that hands the session to the system `ssh` client.
///
/// Terminal sessions have no window concept, so the new-window hint is
/// ignored; the alias is expected to resolve through the operator's SSH
/// configuration.
#[derive(Clone, Copy, Debug)]
pub struct SshLauncher;

impl ConnectLauncher for SshLauncher {
    fn connect(&self, host: &str, _new_window: bool) {
        let status = Command::new("ssh").arg(host).status();
        if let Err(err) = status {
            writeln!(io::stderr(), "error: failed to launch ssh {host}: {err}").ok();
        }
    }
}
