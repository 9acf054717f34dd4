//! Terminal output for the CLI
//!
//! Tables for the transport list, authorized_keys lines for the key list,
//! and colored one-line status messages.

use std::io::Write;

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use tabled::{settings::Style, Table, Tabled};
use wcsa_core::config::AgentConfig;
use wcsa_core::TransportKind;
use wcsa_protocol::PublicKeyEntry;

/// Format every transport as a table
///
/// `ENABLED` reflects `config`; `SUPPORTED` reflects this build.
pub fn format_transports(config: &AgentConfig) -> String {
    #[derive(Tabled)]
    struct TransportRow {
        #[tabled(rename = "ID")]
        id: u8,
        #[tabled(rename = "NAME")]
        name: &'static str,
        #[tabled(rename = "DESCRIPTION")]
        full_name: &'static str,
        #[tabled(rename = "SUPPORTED")]
        supported: &'static str,
        #[tabled(rename = "ENABLED")]
        enabled: &'static str,
    }

    let rows: Vec<TransportRow> = TransportKind::ALL
        .iter()
        .map(|kind| TransportRow {
            id: kind.id(),
            name: kind.name(),
            full_name: kind.full_name(),
            supported: yes_no(kind.is_supported()),
            enabled: yes_no(config.is_enabled(*kind)),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// One authorized_keys line per key
pub fn format_keys(keys: &[PublicKeyEntry]) -> String {
    keys.iter().map(|key| format!("{}\n", key)).collect()
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_marked(mut out: impl Write, color: Color, mark: &str, msg: &str) {
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(mark),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Green check on stdout
pub fn print_success(msg: &str) {
    print_marked(std::io::stdout(), Color::Green, "✓ ", msg);
}

/// Red cross on stderr
pub fn print_error(msg: &str) {
    print_marked(std::io::stderr(), Color::Red, "✗ ", msg);
}

/// Yellow warning sign on stderr
pub fn print_warning(msg: &str) {
    print_marked(std::io::stderr(), Color::Yellow, "⚠ ", msg);
}

/// Cyan info sign on stderr, keeping stdout for data
pub fn print_info(msg: &str) {
    print_marked(std::io::stderr(), Color::Cyan, "ℹ ", msg);
}
