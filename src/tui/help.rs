use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, what: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(format!("{key:<10}"), Style::default().fg(Color::Magenta)),
        Span::raw(what),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        key_line("q / Ctrl-C", "Quit (cancels any running analysis)"),
        key_line("s", "Submit the selected scan (also retries after a failure)"),
        key_line("x", "Clear the selection and stop polling"),
        key_line("r", "Reload the scan file from disk and select it"),
        key_line("y", "Copy the completed result as JSON"),
        key_line("a", "Toggle auto-save"),
        key_line("?", "Toggle this help"),
        Line::from(""),
        Line::from(vec![
            Span::raw("Set "),
            Span::styled("NEURONAV_LOG", Style::default().fg(Color::Magenta)),
            Span::raw(" (e.g. debug) to adjust the log file verbosity."),
        ]),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
