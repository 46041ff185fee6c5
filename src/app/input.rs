//! Input processing layer: key mapping for the list/player views and the
//! search prompt.
//!
//! Pure logic, no I/O. All functions are deterministic and testable.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// Actions produced by key input outside the search prompt. Which of them
/// mean anything depends on the current view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Action {
    Quit,
    Up,
    Down,
    /// Enter: play the selection.
    Select,
    /// `a`: append the selection to the play queue.
    Enqueue,
    /// `l`: open the queue view.
    OpenQueue,
    /// `r`: refresh the feed, or retry sign-in.
    Refresh,
    /// `/`: open the search prompt.
    Search,
    TogglePause,
    SeekBack,
    SeekForward,
    VolumeUp,
    VolumeDown,
    Next,
    Prev,
    Shuffle,
    Back,
}

/// Map a key event to an `Action`.
///
/// Returns `None` for unknown keys and key releases.
pub(super) fn map_key_event(key: KeyEvent) -> Option<Action> {
    let KeyEvent {
        code,
        modifiers,
        kind,
        ..
    } = key;
    if kind == KeyEventKind::Release {
        return None;
    }

    match (code, modifiers) {
        (KeyCode::Char('q'), _) | (KeyCode::Char('c'), KeyModifiers::CONTROL) => {
            Some(Action::Quit)
        }

        (KeyCode::Char('k'), _) | (KeyCode::Up, _) => Some(Action::Up),
        (KeyCode::Char('j'), _) | (KeyCode::Down, _) => Some(Action::Down),
        (KeyCode::Enter, _) => Some(Action::Select),
        (KeyCode::Esc, _) => Some(Action::Back),

        (KeyCode::Char('a'), _) => Some(Action::Enqueue),
        (KeyCode::Char('l'), _) | (KeyCode::Right, _) => Some(Action::OpenQueue),
        (KeyCode::Char('r'), _) => Some(Action::Refresh),
        (KeyCode::Char('/'), _) => Some(Action::Search),

        // player
        (KeyCode::Char(' '), _) => Some(Action::TogglePause),
        (KeyCode::Char('<'), _) => Some(Action::SeekBack),
        (KeyCode::Char('>'), _) => Some(Action::SeekForward),
        (KeyCode::Char('+'), _) | (KeyCode::Char('='), _) => Some(Action::VolumeUp),
        (KeyCode::Char('-'), _) => Some(Action::VolumeDown),
        (KeyCode::Char('n'), _) => Some(Action::Next),
        (KeyCode::Char('p'), _) => Some(Action::Prev),
        (KeyCode::Char('s'), _) => Some(Action::Shuffle),

        _ => None,
    }
}

/// Actions while the search prompt has focus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum SearchAction {
    Type(char),
    Backspace,
    Confirm,
    Cancel,
    /// `q` on an empty prompt, or Ctrl-C.
    Quit,
}

pub(super) fn map_search_key(key: KeyEvent, query_empty: bool) -> Option<SearchAction> {
    let KeyEvent {
        code,
        modifiers,
        kind,
        ..
    } = key;
    if kind == KeyEventKind::Release {
        return None;
    }

    match (code, modifiers) {
        (KeyCode::Char('c'), KeyModifiers::CONTROL) => Some(SearchAction::Quit),
        (KeyCode::Char('q'), _) if query_empty => Some(SearchAction::Quit),
        (KeyCode::Esc, _) => Some(SearchAction::Cancel),
        (KeyCode::Enter, _) => Some(SearchAction::Confirm),
        (KeyCode::Backspace, _) => Some(SearchAction::Backspace),
        (KeyCode::Char(c), m) if !m.contains(KeyModifiers::CONTROL) && !c.is_control() => {
            Some(SearchAction::Type(c))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    fn simple_key(code: KeyCode) -> KeyEvent {
        key(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_q_and_ctrl_c_quit() {
        assert_eq!(map_key_event(simple_key(KeyCode::Char('q'))), Some(Action::Quit));
        assert_eq!(
            map_key_event(key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Action::Quit)
        );
    }

    #[test]
    fn test_navigation_keys() {
        assert_eq!(map_key_event(simple_key(KeyCode::Char('j'))), Some(Action::Down));
        assert_eq!(map_key_event(simple_key(KeyCode::Down)), Some(Action::Down));
        assert_eq!(map_key_event(simple_key(KeyCode::Char('k'))), Some(Action::Up));
        assert_eq!(map_key_event(simple_key(KeyCode::Up)), Some(Action::Up));
        assert_eq!(map_key_event(simple_key(KeyCode::Enter)), Some(Action::Select));
        assert_eq!(map_key_event(simple_key(KeyCode::Esc)), Some(Action::Back));
    }

    #[test]
    fn test_player_keys() {
        assert_eq!(
            map_key_event(simple_key(KeyCode::Char(' '))),
            Some(Action::TogglePause)
        );
        assert_eq!(
            map_key_event(key(KeyCode::Char('>'), KeyModifiers::SHIFT)),
            Some(Action::SeekForward)
        );
        assert_eq!(
            map_key_event(key(KeyCode::Char('<'), KeyModifiers::SHIFT)),
            Some(Action::SeekBack)
        );
        assert_eq!(
            map_key_event(key(KeyCode::Char('+'), KeyModifiers::SHIFT)),
            Some(Action::VolumeUp)
        );
        assert_eq!(map_key_event(simple_key(KeyCode::Char('='))), Some(Action::VolumeUp));
        assert_eq!(map_key_event(simple_key(KeyCode::Char('-'))), Some(Action::VolumeDown));
        assert_eq!(map_key_event(simple_key(KeyCode::Char('n'))), Some(Action::Next));
        assert_eq!(map_key_event(simple_key(KeyCode::Char('p'))), Some(Action::Prev));
        assert_eq!(map_key_event(simple_key(KeyCode::Char('s'))), Some(Action::Shuffle));
    }

    #[test]
    fn test_unknown_key_returns_none() {
        assert_eq!(map_key_event(simple_key(KeyCode::Char('x'))), None);
        assert_eq!(map_key_event(simple_key(KeyCode::F(5))), None);
    }

    #[test]
    fn test_release_is_ignored() {
        let mut ev = simple_key(KeyCode::Char('q'));
        ev.kind = KeyEventKind::Release;
        assert_eq!(map_key_event(ev), None);
    }

    #[test]
    fn test_search_prompt_takes_letters() {
        // `q` and `j` are text inside the prompt once something was typed
        assert_eq!(
            map_search_key(simple_key(KeyCode::Char('q')), false),
            Some(SearchAction::Type('q'))
        );
        assert_eq!(
            map_search_key(simple_key(KeyCode::Char('j')), true),
            Some(SearchAction::Type('j'))
        );
        assert_eq!(
            map_search_key(simple_key(KeyCode::Char('q')), true),
            Some(SearchAction::Quit)
        );
        assert_eq!(
            map_search_key(simple_key(KeyCode::Backspace), false),
            Some(SearchAction::Backspace)
        );
        assert_eq!(
            map_search_key(simple_key(KeyCode::Enter), false),
            Some(SearchAction::Confirm)
        );
        assert_eq!(
            map_search_key(simple_key(KeyCode::Esc), false),
            Some(SearchAction::Cancel)
        );
        assert_eq!(
            map_search_key(key(KeyCode::Char('c'), KeyModifiers::CONTROL), false),
            Some(SearchAction::Quit)
        );
    }
}
