//! Colored terminal output
//!
//! Respects `NO_COLOR` and the `--color` flag.

use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Resolve `ColorChoice` from the CLI flag and environment.
///
/// Priority: `NO_COLOR` env > `--color` flag > auto-detect TTY.
pub fn resolve_color_choice(flag: Option<&str>) -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        return ColorChoice::Never;
    }
    match flag {
        Some("always") => ColorChoice::Always,
        Some("never") => ColorChoice::Never,
        _ => ColorChoice::Auto,
    }
}

pub struct StyledOutput {
    stdout: StandardStream,
}

impl StyledOutput {
    pub fn new(choice: ColorChoice) -> Self {
        Self {
            stdout: StandardStream::stdout(choice),
        }
    }

    fn styled(&mut self, text: &str, color: Option<Color>, bold: bool) {
        let mut spec = ColorSpec::new();
        spec.set_fg(color).set_bold(bold);
        let _ = self.stdout.set_color(&spec);
        let _ = write!(self.stdout, "{}", text);
        let _ = self.stdout.reset();
    }

    /// Green bold text
    pub fn success(&mut self, text: &str) {
        self.styled(text, Some(Color::Green), true);
    }

    /// Red bold text
    pub fn error(&mut self, text: &str) {
        self.styled(text, Some(Color::Red), true);
    }

    /// Yellow bold text
    pub fn warning(&mut self, text: &str) {
        self.styled(text, Some(Color::Yellow), true);
    }

    /// Cyan text
    pub fn info(&mut self, text: &str) {
        self.styled(text, Some(Color::Cyan), false);
    }

    pub fn plain(&mut self, text: &str) {
        let _ = write!(self.stdout, "{}", text);
    }

    pub fn newline(&mut self) {
        let _ = writeln!(self.stdout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_flag() {
        if std::env::var_os("NO_COLOR").is_some() {
            return;
        }
        assert_eq!(resolve_color_choice(Some("always")), ColorChoice::Always);
        assert_eq!(resolve_color_choice(Some("never")), ColorChoice::Never);
        assert_eq!(resolve_color_choice(None), ColorChoice::Auto);
    }
}
