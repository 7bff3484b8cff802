//! Terminal rendering for scr reports

use std::fmt;

use colored::Colorize;

/// Titled block of labelled values, labels aligned in one column
#[derive(Debug)]
pub(crate) struct Report {
    title: &'static str,
    rows: Vec<(&'static str, String)>,
}

impl Report {
    pub(crate) const fn new(title: &'static str) -> Self {
        Self {
            title,
            rows: Vec::new(),
        }
    }

    pub(crate) fn row(mut self, label: &'static str, value: impl fmt::Display) -> Self {
        self.rows.push((label, value.to_string()));
        self
    }

    /// Bytes as space separated upper case hex
    pub(crate) fn bytes(self, label: &'static str, bytes: &[u8]) -> Self {
        let value = bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");
        self.row(label, value)
    }

    /// A byte the card may not have sent, shown as `-` when absent
    pub(crate) fn byte(self, label: &'static str, byte: Option<u8>) -> Self {
        match byte {
            Some(b) => self.row(label, format!("{b:02X}")),
            None => self.row(label, "-"),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title.bold().underline())?;
        let width = self.rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        for (label, value) in &self.rows {
            let label = format!("{label:<width$}");
            write!(f, "\n  {}  {value}", label.bold())?;
        }
        Ok(())
    }
}

/// One line verdict printed under a report
#[derive(Debug)]
pub(crate) enum Verdict {
    Pass(String),
    Flag(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass(message) => write!(f, "\n✅ {}", message.green().bold()),
            Self::Flag(message) => write!(f, "\n⚠️  {}", message.yellow().bold()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_layout() {
        colored::control::set_override(false);
        let report = Report::new("PPS")
            .bytes("Bytes", &[0xFF, 0x10, 0x96, 0x79])
            .byte("SPU", None)
            .byte("PCK", Some(0x0A))
            .row("Protocol", "T=1");
        assert_eq!(
            report.to_string(),
            "PPS\n  Bytes     FF 10 96 79\n  SPU       -\n  PCK       0A\n  Protocol  T=1"
        );
        assert_eq!(Report::new("Empty").to_string(), "Empty");
    }

    #[test]
    fn test_verdicts() {
        colored::control::set_override(false);
        assert_eq!(Verdict::Pass("PPS confirmed".into()).to_string(), "\n✅ PPS confirmed");
        assert_eq!(Verdict::Flag("Status 6D 00".into()).to_string(), "\n⚠️  Status 6D 00");
    }
}
