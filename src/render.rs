//! Terminal rendering of a report.

use std::collections::HashMap;
use std::io::{Result, Write};

use colored::*;
use colourado::{ColorPalette, PaletteType};

use crate::aggregate::{Report, ReportEntry};
use crate::result::Status;

pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn render<W: Write>(&self, report: &Report, out: &mut W) -> Result<()> {
        let tags = self.tags(report);
        for entry in report.entries() {
            let tag = &tags[entry.target.as_str()];
            self.render_entry(entry, tag, out)?;
        }
        let summary = report.summary();
        writeln!(
            out,
            "{} succeeded, {} failed, {} dispatch errors",
            summary.succeeded, summary.failed, summary.dispatch_errors
        )
    }

    fn render_entry<W: Write>(&self, entry: &ReportEntry, tag: &Tag, out: &mut W) -> Result<()> {
        match (entry.status, entry.exit_code) {
            (Status::DispatchError, _) => writeln!(
                out,
                "{} === {} ({}) ===",
                tag.out,
                self.status(entry.status),
                entry.error.as_deref().unwrap_or("unknown error")
            )?,
            (status, Some(code)) => {
                writeln!(out, "{} === {} (exit {}) ===", tag.out, self.status(status), code)?
            }
            (status, None) => writeln!(
                out,
                "{} === {} ({}) ===",
                tag.out,
                self.status(status),
                entry.error.as_deref().unwrap_or("no exit status")
            )?,
        }
        write_lines(out, &tag.out, &entry.stdout)?;
        write_lines(out, &tag.err, &entry.stderr)
    }

    fn status(&self, status: Status) -> ColoredString {
        let text = status.to_string();
        if !self.color {
            return text.normal();
        }
        match status {
            Status::Succeeded => text.green(),
            Status::Failed => text.red(),
            Status::DispatchError => text.yellow(),
        }
    }

    /// One colored `[target]` / `[target!]` pair per distinct target.
    fn tags<'a>(&self, report: &'a Report) -> HashMap<&'a str, Tag> {
        let mut targets: Vec<&'a str> = Vec::new();
        for entry in report.entries() {
            if !targets.contains(&entry.target.as_str()) {
                targets.push(&entry.target);
            }
        }
        let colors = if self.color && !targets.is_empty() {
            ColorPalette::new(targets.len() as u32, PaletteType::Pastel, false).colors
        } else {
            Vec::new()
        };
        targets
            .iter()
            .enumerate()
            .map(|(i, target)| {
                let out = format!("[{}]", target);
                let err = format!("[{}!]", target);
                let tag = match colors.get(i) {
                    Some(color) => {
                        let r = (color.red * 255.0) as u8;
                        let g = (color.green * 255.0) as u8;
                        let b = (color.blue * 255.0) as u8;
                        Tag {
                            out: out.truecolor(r, g, b).to_string(),
                            err: err.truecolor(r, g, b).to_string(),
                        }
                    }
                    None => Tag { out, err },
                };
                (*target, tag)
            })
            .collect()
    }
}

struct Tag {
    out: String,
    err: String,
}

/// Writes `bytes` line by line, splitting on either `\r` or `\n`, each line behind `prefix`.
/// Invalid UTF-8 becomes U+FFFD; nothing is dropped.
fn write_lines<W: Write>(out: &mut W, prefix: &str, bytes: &[u8]) -> Result<()> {
    let mut rest = bytes;
    while !rest.is_empty() {
        let (line, next) = match memchr::memchr2(b'\r', b'\n', rest) {
            Some(i) => {
                // Treat "\r\n" as a single break.
                let skip = if rest[i] == b'\r' && rest.get(i + 1) == Some(&b'\n') {
                    2
                } else {
                    1
                };
                (&rest[..i], &rest[i + skip..])
            }
            None => (rest, &rest[rest.len()..]),
        };
        writeln!(out, "{} {}", prefix, String::from_utf8_lossy(line))?;
        rest = next;
    }
    Ok(())
}
