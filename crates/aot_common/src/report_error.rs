use ansi_term::Color;
use std::io;
use textwrap::{NoHyphenation, Wrapper};

/// An error which knows how to present itself to a human at the command line.
pub trait Reportable {
    fn report(&self, dest: &mut impl io::Write) -> io::Result<()>;

    fn exit_status(&self) -> i32;
}

#[derive(Clone, Copy, Debug)]
pub struct Report<'a> {
    pub title: &'a str,
    /// Where the failure happened, e.g. the name of the graph being compiled.
    pub context: Option<&'a str>,
    pub message: Option<&'a str>,
}

const TITLE_LEADING_DASHES: usize = 10;
const TITLE_TOTAL_COLS: usize = 60;
const MESSAGE_WIDTH: usize = 60;

fn write_wrapped(dest: &mut impl io::Write, message: &str) -> io::Result<()> {
    for line in message.lines() {
        let indentation = line.chars().take_while(|&c| c == ' ').count();
        let indent_str = &line[..indentation];

        let wrapped = Wrapper::with_splitter(MESSAGE_WIDTH, NoHyphenation)
            .initial_indent(indent_str)
            .subsequent_indent(indent_str)
            .wrap(&line[indentation..]);

        if wrapped.is_empty() {
            writeln!(dest)?;
        } else {
            for wrapped_line in wrapped {
                writeln!(dest, "{}", wrapped_line)?;
            }
        }
    }
    Ok(())
}

pub fn report_error(dest: &mut impl io::Write, report: Report) -> io::Result<()> {
    let title_style = Color::Red.bold();
    let context_style = Color::Yellow.normal();

    writeln!(
        dest,
        "\n{}",
        title_style.paint(format!(
            "{leading} {title} {trailing}",
            leading = "-".repeat(TITLE_LEADING_DASHES),
            title = report.title,
            trailing = "-".repeat(
                TITLE_TOTAL_COLS.saturating_sub(2 + report.title.len() + TITLE_LEADING_DASHES)
            ),
        ))
    )?;

    if let Some(context) = report.context {
        writeln!(dest, "{}", context_style.paint(context))?;
    }

    if let Some(message) = report.message {
        writeln!(dest)?;
        write_wrapped(dest, message)?;
    }

    writeln!(dest)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn long_messages_are_wrapped() {
        let message = "word ".repeat(40);
        let mut out = Vec::new();
        report_error(
            &mut out,
            Report {
                title: "Guard Violation",
                context: Some("graph 0_inference"),
                message: Some(&message),
            },
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Guard Violation"));
        assert!(text.contains("graph 0_inference"));
        assert!(text.lines().all(|line| line.len() <= MESSAGE_WIDTH + 40));
        assert!(text.lines().filter(|line| line.starts_with("word")).count() > 1);
    }
}
