//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the application table, the merged log pane and any open modal
//! using `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{
    Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap,
};
use ratatui::Terminal;

use crate::app::{App, Focus, ModalContent, StatusLevel};
use crate::output::{FeedLine, StreamKind};
use crate::process::{ProcessStatus, ProcessView};

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const LABEL_PALETTE: [Color; 6] = [
    Color::LightCyan,
    Color::LightGreen,
    Color::LightMagenta,
    Color::LightYellow,
    Color::LightBlue,
    Color::LightRed,
];
const LABEL_WIDTH: usize = 12;

/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, SetTitle("appman"))?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Disables raw mode, leaves the alternate screen, and shows the cursor.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    let views = app.views();
    terminal.draw(|frame| {
        let area = frame.size();
        let table_height = (views.len() as u16 + 3).min(area.height / 2).max(4);
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(table_height),
                Constraint::Min(3),
                Constraint::Length(4),
            ])
            .split(area);

        let table_block = pane_block("Applications", app.focus == Focus::Table);
        let table_area = table_block.inner(vertical[0]);
        frame.render_widget(table_block, vertical[0]);
        let table_parts = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(1), Constraint::Min(0)])
            .split(table_area);
        frame.render_widget(
            Paragraph::new(Span::styled(
                format!("  {}", ProcessView::header()),
                Style::default().add_modifier(Modifier::BOLD),
            )),
            table_parts[0],
        );
        let items: Vec<ListItem> = views
            .iter()
            .map(|view| ListItem::new(Span::styled(view.row_text(), status_style(view.status))))
            .collect();
        let list = List::new(items)
            .highlight_symbol("▶ ")
            .highlight_style(Style::default().add_modifier(Modifier::BOLD | Modifier::REVERSED));
        frame.render_stateful_widget(list, table_parts[1], &mut list_state(app.selected, views.len()));

        let log_block = pane_block(&log_title(app), app.focus == Focus::Logs);
        let log_area = log_block.inner(vertical[1]);
        app.set_log_view_height(log_area.height as usize);
        let lines = app.visible_lines();
        if lines.is_empty() {
            frame.render_widget(
                Paragraph::new("No output yet")
                    .style(Style::default().fg(Color::DarkGray))
                    .block(log_block),
                vertical[1],
            );
        } else {
            let text = Text::from(lines.iter().map(render_feed_line).collect::<Vec<_>>());
            frame.render_widget(Paragraph::new(text).block(log_block), vertical[1]);
        }

        let help_line = match app.status_message() {
            Some((text, level)) => Span::styled(text.to_string(), message_style(level)),
            None => Span::styled(
                "Up/Down select | Tab switch pane | Enter actions | PgUp/PgDn/Home/End scroll | Esc exit | Ctrl-C shut down all",
                Style::default().fg(Color::DarkGray),
            ),
        };
        let status = Paragraph::new(Text::from(vec![
            Line::from(Span::raw(app.status_line())),
            Line::from(help_line),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(Style::default().fg(Color::DarkGray)),
        );
        frame.render_widget(status, vertical[2]);

        if let Some(content) = app.modal_content() {
            let popup_area = centered_rect(50, 30, area);
            frame.render_widget(Clear, popup_area);
            frame.render_widget(render_modal(&content), popup_area);
        }
    })?;
    Ok(())
}

fn pane_block(title: &str, focused: bool) -> Block<'static> {
    Block::default()
        .title(title.to_string())
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(if focused {
            Style::default().fg(Color::Cyan)
        } else {
            Style::default().fg(Color::DarkGray)
        })
}

fn log_title(app: &App) -> String {
    if app.is_following() {
        "Logs".to_string()
    } else {
        "Logs (paused, End to follow)".to_string()
    }
}

fn render_feed_line(line: &FeedLine) -> Line<'static> {
    let text_style = match line.stream {
        StreamKind::Stdout => Style::default(),
        StreamKind::Stderr => Style::default().fg(Color::LightRed),
    };
    Line::from(vec![
        Span::styled(
            format!("{:<width$}", truncate(&line.label, LABEL_WIDTH), width = LABEL_WIDTH),
            Style::default().fg(label_color(&line.label)),
        ),
        Span::styled(" | ", Style::default().fg(Color::DarkGray)),
        Span::styled(line.text.clone(), text_style),
    ])
}

fn render_modal(content: &ModalContent) -> Paragraph<'static> {
    let mut buttons = Vec::new();
    for (idx, label) in content.buttons.iter().enumerate() {
        if idx > 0 {
            buttons.push(Span::raw("  "));
        }
        let style = if idx == content.selected {
            Style::default().fg(Color::Black).bg(Color::Cyan).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::White)
        };
        buttons.push(Span::styled(format!(" {} ", label), style));
    }
    Paragraph::new(Text::from(vec![
        Line::from(""),
        Line::from(content.prompt.clone()),
        Line::from(""),
        Line::from(buttons),
    ]))
    .alignment(Alignment::Center)
    .wrap(Wrap { trim: true })
    .block(
        Block::default()
            .title(content.title.clone())
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded),
    )
    .style(Style::default().bg(Color::DarkGray).fg(Color::White))
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn list_state(selected: usize, len: usize) -> ListState {
    let mut state = ListState::default();
    if len > 0 {
        state.select(Some(selected.min(len - 1)));
    }
    state
}

/// Stable colour for a label: FNV-1a over its bytes, modulo the palette.
pub fn label_color(label: &str) -> Color {
    LABEL_PALETTE[fnv1a(label.as_bytes()) as usize % LABEL_PALETTE.len()]
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn status_style(status: ProcessStatus) -> Style {
    match status {
        ProcessStatus::Stopped => Style::default().fg(Color::Gray),
        ProcessStatus::Starting => Style::default().fg(Color::Yellow),
        ProcessStatus::Running => Style::default().fg(Color::Green),
        ProcessStatus::Error => Style::default().fg(Color::Red),
    }
}

fn message_style(level: StatusLevel) -> Style {
    match level {
        StatusLevel::Info => Style::default().fg(Color::Cyan),
        StatusLevel::Warning => Style::default().fg(Color::Yellow),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_values() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
    }

    #[test]
    fn label_colour_is_stable_per_name() {
        assert_eq!(label_color(""), Color::LightGreen);
        assert_eq!(label_color("a"), Color::LightBlue);
        assert_eq!(label_color("api"), Color::LightRed);
        assert_eq!(label_color("api"), label_color("api"));
        assert_eq!(label_color("appman"), Color::LightBlue);
        assert_eq!(label_color("web"), Color::LightGreen);
    }

    #[test]
    fn feed_line_is_labeled_and_padded() {
        let line = FeedLine {
            label: "a-very-long-application".into(),
            text: "listening".to_string(),
            stream: StreamKind::Stderr,
        };
        let rendered = render_feed_line(&line);
        assert_eq!(rendered.spans[0].content, "a-very-long~");
        assert_eq!(rendered.spans[2].content, "listening");
        assert_eq!(rendered.spans[2].style.fg, Some(Color::LightRed));
    }

    #[test]
    fn centered_rect_stays_inside() {
        let outer = Rect::new(0, 0, 100, 40);
        let inner = centered_rect(50, 30, outer);
        assert_eq!(inner.width, 50);
        assert!(inner.x >= 25 && inner.y >= 13);
    }

    #[test]
    fn list_state_clamps_selection() {
        assert_eq!(list_state(5, 3).selected(), Some(2));
        assert_eq!(list_state(0, 0).selected(), None);
    }
}
