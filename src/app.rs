//! Application state and UI logic.
//!
//! `App` owns presentation state only: which row is selected, which pane has
//! focus, the open modal and the log scroll position. Process state is always
//! read back from the shared registry, so a row index is the only thing the
//! UI ever remembers about an entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::output::{FeedLine, LogFeed};
use crate::process::{actions_for, Action, ProcessStatus, ProcessView};
use crate::registry::Registry;

const EXIT_PROMPT: &str = "Do you want to exit? Running applications will be shut down.";
const EXIT_BUTTONS: [&str; 2] = ["Exit", "Cancel"];

/// Which pane receives navigation keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Table,
    Logs,
}

/// A popup that captures all input until closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modal {
    /// Actions for the entry at `id` as offered for `shown`, the status it
    /// had when the modal opened; `selected` is the highlighted button.
    Action {
        id: usize,
        shown: ProcessStatus,
        selected: usize,
    },
    /// Exit confirmation.
    ConfirmExit { selected: usize },
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    /// No action required.
    None,
    /// Launch the entry at this index.
    Start(usize),
    /// Shut down the entry at this index.
    Stop(usize),
    /// Stop everything still running and exit.
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// Everything outside `App` that a frame depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameStamp {
    feed_seq: u64,
    views: Vec<ProcessView>,
    message: Option<String>,
}

/// What a modal shows right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModalContent {
    pub title: String,
    pub prompt: String,
    pub buttons: Vec<&'static str>,
    pub selected: usize,
}

#[derive(Debug)]
pub struct App {
    registry: Arc<Registry>,
    feed: LogFeed,
    /// Index of the highlighted row.
    pub selected: usize,
    pub focus: Focus,
    pub modal: Option<Modal>,
    /// Flag indicating if the application should exit.
    pub should_quit: bool,
    log_view_height: usize,
    log_scroll: usize,
    log_follow: bool,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(registry: Arc<Registry>, feed: LogFeed) -> Self {
        Self {
            registry,
            feed,
            selected: 0,
            focus: Focus::Table,
            modal: None,
            should_quit: false,
            log_view_height: 0,
            log_scroll: 0,
            log_follow: true,
            status_message: None,
        }
    }

    pub fn views(&self) -> Vec<ProcessView> {
        self.registry.views()
    }

    /// Differs from the previous stamp whenever a redraw would show something new.
    pub fn frame_stamp(&self) -> FrameStamp {
        FrameStamp {
            feed_seq: self.feed.seq(),
            views: self.registry.views(),
            message: self.status_message().map(|(text, _)| text.to_string()),
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            self.modal = None;
            return AppAction::Quit;
        }
        match self.modal {
            Some(modal) => self.handle_modal_input(modal, key),
            None => self.handle_normal_input(key),
        }
    }

    fn handle_normal_input(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Tab | KeyCode::BackTab => {
                self.focus = match self.focus {
                    Focus::Table => Focus::Logs,
                    Focus::Logs => Focus::Table,
                };
            }
            KeyCode::Esc => {
                self.modal = Some(Modal::ConfirmExit { selected: 0 });
            }
            KeyCode::Enter if self.focus == Focus::Table => {
                if let Some(view) = self.registry.view(self.selected) {
                    self.modal = Some(Modal::Action {
                        id: self.selected,
                        shown: view.status,
                        selected: 0,
                    });
                }
            }
            KeyCode::Up => match self.focus {
                Focus::Table => self.selected = self.selected.saturating_sub(1),
                Focus::Logs => self.scroll_up(1),
            },
            KeyCode::Down => match self.focus {
                Focus::Table => {
                    if self.selected + 1 < self.registry.len() {
                        self.selected += 1;
                    }
                }
                Focus::Logs => self.scroll_down(1),
            },
            KeyCode::PageUp => self.scroll_up(self.page()),
            KeyCode::PageDown => self.scroll_down(self.page()),
            KeyCode::Home => self.scroll_to_top(),
            KeyCode::End => self.log_follow = true,
            _ => {}
        }
        AppAction::None
    }

    fn handle_modal_input(&mut self, modal: Modal, key: KeyEvent) -> AppAction {
        let buttons = self.button_count(modal);
        let selected = match modal {
            Modal::Action { selected, .. } | Modal::ConfirmExit { selected } => selected,
        };
        match key.code {
            KeyCode::Esc => {
                self.modal = None;
                AppAction::None
            }
            KeyCode::Left | KeyCode::BackTab => {
                self.set_modal_selection(modal, selected.saturating_sub(1));
                AppAction::None
            }
            KeyCode::Right | KeyCode::Tab => {
                if selected + 1 < buttons {
                    self.set_modal_selection(modal, selected + 1);
                }
                AppAction::None
            }
            KeyCode::Enter => {
                self.modal = None;
                self.confirm(modal)
            }
            _ => AppAction::None,
        }
    }

    /// Runs the pressed button only if the entry's current status still
    /// offers it. A button shown for a status the entry has since left does
    /// nothing.
    fn confirm(&mut self, modal: Modal) -> AppAction {
        match modal {
            Modal::ConfirmExit { selected } => {
                if selected == 0 {
                    AppAction::Quit
                } else {
                    AppAction::None
                }
            }
            Modal::Action {
                id,
                shown,
                selected,
            } => {
                let Some(view) = self.registry.view(id) else {
                    return AppAction::None;
                };
                let shown_actions = actions_for(shown);
                let action = shown_actions
                    .get(selected.min(shown_actions.len().saturating_sub(1)))
                    .copied()
                    .unwrap_or(Action::Cancel);
                if action == Action::Cancel {
                    return AppAction::None;
                }
                if !view.actions().contains(&action) {
                    self.set_status_warning(format!(
                        "{} is now {}; {} not performed",
                        view.name,
                        view.status,
                        action.label()
                    ));
                    return AppAction::None;
                }
                match action {
                    Action::Launch => AppAction::Start(id),
                    Action::Shutdown => AppAction::Stop(id),
                    Action::Cancel => AppAction::None,
                }
            }
        }
    }

    fn button_count(&self, modal: Modal) -> usize {
        match modal {
            Modal::ConfirmExit { .. } => EXIT_BUTTONS.len(),
            Modal::Action { shown, .. } => actions_for(shown).len(),
        }
    }

    fn set_modal_selection(&mut self, modal: Modal, selected: usize) {
        self.modal = Some(match modal {
            Modal::Action { id, shown, .. } => Modal::Action {
                id,
                shown,
                selected,
            },
            Modal::ConfirmExit { .. } => Modal::ConfirmExit { selected },
        });
    }

    pub fn modal_content(&self) -> Option<ModalContent> {
        match self.modal? {
            Modal::ConfirmExit { selected } => Some(ModalContent {
                title: "Exit".to_string(),
                prompt: EXIT_PROMPT.to_string(),
                buttons: EXIT_BUTTONS.to_vec(),
                selected,
            }),
            Modal::Action {
                id,
                shown,
                selected,
            } => {
                let mut view = self.registry.view(id)?;
                view.status = shown;
                let buttons: Vec<&'static str> =
                    view.actions().iter().map(|action| action.label()).collect();
                Some(ModalContent {
                    title: view.name.clone(),
                    prompt: view.prompt(),
                    selected: selected.min(buttons.len().saturating_sub(1)),
                    buttons,
                })
            }
        }
    }

    fn page(&self) -> usize {
        self.log_view_height.max(1)
    }

    fn max_scroll(&self) -> usize {
        self.feed.len().saturating_sub(self.log_view_height.max(1))
    }

    fn current_scroll(&self) -> usize {
        if self.log_follow {
            self.max_scroll()
        } else {
            self.log_scroll.min(self.max_scroll())
        }
    }

    pub fn scroll_up(&mut self, amount: usize) {
        self.log_scroll = self.current_scroll().saturating_sub(amount);
        self.log_follow = false;
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let max_scroll = self.max_scroll();
        let next = (self.current_scroll() + amount).min(max_scroll);
        self.log_scroll = next;
        self.log_follow = next == max_scroll;
    }

    pub fn scroll_to_top(&mut self) {
        self.log_scroll = 0;
        self.log_follow = false;
    }

    pub fn is_following(&self) -> bool {
        self.log_follow
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
    }

    /// Lines for the log pane at the current scroll position.
    pub fn visible_lines(&self) -> Vec<FeedLine> {
        self.feed
            .window(self.current_scroll(), self.log_view_height.max(1))
    }

    pub fn status_line(&self) -> String {
        let views = self.registry.views();
        let running = views
            .iter()
            .filter(|view| view.status == ProcessStatus::Running)
            .count();
        let failed = views
            .iter()
            .filter(|view| view.status == ProcessStatus::Error)
            .count();
        format!(
            "apps: {} | running: {} | error: {} | lines: {} | focus: {} | follow: {}",
            views.len(),
            running,
            failed,
            self.feed.len(),
            match self.focus {
                Focus::Table => "table",
                Focus::Logs => "logs",
            },
            if self.log_follow { "on" } else { "off" }
        )
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        let still_visible = match message.ttl {
            Some(ttl) => message.at.elapsed() < ttl,
            None => true,
        };
        still_visible.then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, Some(Duration::from_secs(5)));
    }

    pub fn set_status_warning_persistent(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, None);
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}
