//! Visual display modes: a tabular view and a per-message dot-graph view,
//! both showing a running "[Msgs: N of M]" reconciled count, rendered with
//! `ratatui`/`crossterm`.

use std::io::Stdout;

use crossterm::{
    execute,
    terminal::{enable_raw_mode, EnterAlternateScreen},
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Constraint;
use ratatui::style::{Modifier, Style};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Terminal;

use crate::guard::TerminalGuard;
use crate::tracker::Tracker;

pub struct Display {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    _guard: TerminalGuard,
}

impl Display {
    pub fn new() -> anyhow::Result<Self> {
        enable_raw_mode()?;
        execute!(std::io::stdout(), EnterAlternateScreen)?;
        let terminal = Terminal::new(CrosstermBackend::new(std::io::stdout()))?;
        Ok(Self { terminal, _guard: TerminalGuard::new() })
    }

    /// Tabular view: one row per message with sent/received/elapsed
    /// columns.
    pub fn render_table(&mut self, tracker: &Tracker, reconciled: usize) -> anyhow::Result<()> {
        let total = tracker.total();
        let header = Row::new(vec!["Message", "Sent At", "Received At", "Elapsed"])
            .style(Style::default().add_modifier(Modifier::BOLD));

        let rows: Vec<Row> = tracker
            .records()
            .iter()
            .map(|m| {
                let recv = m
                    .time_recv
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "---".to_string());
                let elapsed = m
                    .time_elapsed
                    .map(|d| format!("{:.3}s", d.as_secs_f64()))
                    .unwrap_or_else(|| "---".to_string());
                Row::new(vec![
                    Cell::from(m.msg.clone()),
                    Cell::from(m.time_send.format("%H:%M:%S").to_string()),
                    Cell::from(recv),
                    Cell::from(elapsed),
                ])
            })
            .collect();

        let widths = [
            Constraint::Length(30),
            Constraint::Length(12),
            Constraint::Length(14),
            Constraint::Length(12),
        ];
        let title = format!("[Msgs: {reconciled} of {total}]");
        let table = Table::new(rows, widths)
            .header(header)
            .block(Block::default().borders(Borders::ALL).title(title));

        self.terminal.draw(|frame| frame.render_widget(table, frame.area()))?;
        Ok(())
    }

    /// Dot-graph view: one character per message, `o` once received, `.`
    /// while outstanding.
    pub fn render_graph(&mut self, tracker: &Tracker, reconciled: usize) -> anyhow::Result<()> {
        let total = tracker.total();
        let dots: String = tracker
            .records()
            .iter()
            .map(|m| if m.time_recv.is_some() { 'o' } else { '.' })
            .collect();

        let title = format!("[Msgs: {reconciled} of {total}]");
        let paragraph = Paragraph::new(dots)
            .wrap(ratatui::widgets::Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title(title));

        self.terminal.draw(|frame| frame.render_widget(paragraph, frame.area()))?;
        Ok(())
    }
}
