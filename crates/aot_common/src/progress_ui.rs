use std::borrow::Cow;
use std::time::Duration;

use crate::util::progress_logger::{ProgressLogger, ProgressSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProgressMode {
    Hidden,
    Visible,
}

impl Default for ProgressMode {
    fn default() -> Self {
        ProgressMode::Hidden
    }
}

#[derive(Clone, Debug)]
pub struct ProgressBarLogger {
    name: String,
    mode: ProgressMode,
}

pub fn bar(mode: ProgressMode, name: impl ToString) -> ProgressBarLogger {
    ProgressBarLogger {
        name: name.to_string(),
        mode,
    }
}

#[derive(Clone, Debug)]
pub struct ProgressBarSession {
    name: String,
    bar: indicatif::ProgressBar,
}

const TICK_STRINGS: &[&str] = &["⠉", "⠘", "⠰", "⠤", "⠆", "⠃", "✔"];

fn counted_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:.green/white}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        .progress_chars("=> ")
        .tick_strings(TICK_STRINGS)
}

fn spinner_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner())
        .tick_strings(TICK_STRINGS)
}

impl ProgressLogger for ProgressBarLogger {
    type Session = ProgressBarSession;

    fn start_session(self, count: Option<usize>) -> Self::Session {
        let target = match self.mode {
            ProgressMode::Hidden => indicatif::ProgressDrawTarget::hidden(),
            ProgressMode::Visible => indicatif::ProgressDrawTarget::stderr(),
        };
        let bar = indicatif::ProgressBar::with_draw_target(count.map(|count| count as u64), target);
        bar.set_style(if count.is_some() {
            counted_style()
        } else {
            spinner_style()
        });
        bar.set_message(Cow::Owned(self.name.clone()));
        if self.mode == ProgressMode::Visible {
            bar.enable_steady_tick(Duration::from_millis(100));
        }
        ProgressBarSession {
            name: self.name,
            bar,
        }
    }
}

impl ProgressSession for ProgressBarSession {
    fn update(&mut self, inc: usize) {
        self.bar.inc(inc as u64);
    }

    fn note(&mut self, status: &str) {
        self.bar
            .set_message(Cow::Owned(format!("{}: {}", self.name, status)));
    }

    fn finish(self) {
        self.bar.finish_with_message(Cow::Owned(self.name));
    }
}
