#[macro_use]
pub mod util;

pub mod config;
pub mod progress_ui;
pub mod report_error;
