use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Keyboard commands for the running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TogglePause,
    Cancel,
}

/// Reads key presses in raw mode until `token` is cancelled.
///
/// `p` toggles pause, `q` and Ctrl-C cancel. Raw mode swallows the terminal's
/// own Ctrl-C signal, so it is handled here. Blocking; run it on
/// `spawn_blocking`.
pub fn key_loop(commands: mpsc::Sender<Command>, token: CancellationToken) {
    if terminal::enable_raw_mode().is_err() {
        info!("Failed to enable raw mode. Input handling will be disabled.");
        return;
    }

    while !token.is_cancelled() {
        let Ok(true) = event::poll(Duration::from_millis(100)) else {
            continue;
        };
        let Ok(Event::Key(key)) = event::read() else {
            continue;
        };
        let Some(command) = command_for(key) else {
            continue;
        };
        if commands.blocking_send(command).is_err() {
            break;
        }
    }

    if terminal::disable_raw_mode().is_err() {
        info!("Failed to disable raw mode.");
    }
}

fn command_for(key: KeyEvent) -> Option<Command> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match (key.code, key.modifiers) {
        (KeyCode::Char('p'), KeyModifiers::NONE) => Some(Command::TogglePause),
        (KeyCode::Char('q'), KeyModifiers::NONE) => Some(Command::Cancel),
        (KeyCode::Char('c'), KeyModifiers::CONTROL) => Some(Command::Cancel),
        _ => None,
    }
}
