use serde_json::Value;

use crate::{
    context::DocumentContext,
    dom::{Document, NodeId},
    messages::{Command, RuntimeMessage},
    prefs::{normalize_shortcut_key, ShortcutBindings},
    speed::SPEED_STEP,
};

const EDITABLE_TAGS: [&str; 2] = ["input", "textarea"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyEvent {
    pub key: String,
    pub code: String,
    pub ctrl: bool,
    pub meta: bool,
    // Element the event was dispatched to; the focused element when `None`.
    pub target: Option<NodeId>,
}

impl KeyEvent {
    pub fn new(key: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn from_key(key: &str) -> Self {
        Self::new(key, "")
    }

    pub fn with_ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn with_meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn with_target(mut self, target: NodeId) -> Self {
        self.target = Some(target);
        self
    }
}

fn normalize_code(code: &str) -> Option<char> {
    match code {
        "Comma" => Some(','),
        "Period" => Some('.'),
        "Slash" => Some('/'),
        "Semicolon" => Some(';'),
        "Minus" => Some('-'),
        "Equal" => Some('='),
        _ => {
            let rest = code
                .strip_prefix("Key")
                .or_else(|| code.strip_prefix("Digit"))?;
            normalize_shortcut_key(rest)
        }
    }
}

pub fn parse_command(event: &KeyEvent, bindings: &ShortcutBindings) -> Option<Command> {
    // Leave every system chord (reload included) to the host.
    if event.ctrl || event.meta {
        return None;
    }

    let key = normalize_shortcut_key(&event.key);
    let code = normalize_code(&event.code);
    let matches = |binding: char| key == Some(binding) || code == Some(binding);

    if matches(bindings.decrease) {
        Some(Command::Decrease)
    } else if matches(bindings.increase) {
        Some(Command::Increase)
    } else if matches(bindings.toggle) {
        Some(Command::Toggle)
    } else {
        None
    }
}

pub fn should_ignore_target(doc: &Document, target: Option<NodeId>) -> bool {
    let Some(target) = target else {
        return false;
    };
    doc.tag(target)
        .is_some_and(|tag| EDITABLE_TAGS.contains(&tag))
        || doc.is_content_editable(target)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeydownOutcome {
    Ignored,
    Applied(f64),
    Relayed(Command),
    Unresolved,
}

impl KeydownOutcome {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Applied(_) | Self::Relayed(_))
    }
}

impl DocumentContext {
    fn execute_command(&mut self, command: Command, highlight: bool) -> Option<f64> {
        let element = self.tracker.find_active_video(&self.document)?;
        let speed = self.tracker.speed_mut();
        let rate = match command {
            Command::Decrease => speed.change_speed(&mut self.document, Some(element), -SPEED_STEP),
            Command::Increase => speed.change_speed(&mut self.document, Some(element), SPEED_STEP),
            Command::Toggle => speed.toggle_preferred_speed(
                &mut self.document,
                Some(element),
                self.state.preferred_speed,
            ),
        }?;
        self.overlays.update_speed(
            &mut self.document,
            element,
            rate,
            highlight,
            std::time::Instant::now(),
        );
        self.pump();
        Some(rate)
    }

    pub fn apply_command_to_active_video(&mut self, command: Command, highlight: bool) -> bool {
        self.execute_command(command, highlight).is_some()
    }

    pub fn handle_keydown(&mut self, event: &KeyEvent) -> KeydownOutcome {
        let target = event.target.or_else(|| self.document.active_element());
        if should_ignore_target(&self.document, target) {
            return KeydownOutcome::Ignored;
        }
        let Some(command) = parse_command(event, &self.state.shortcuts) else {
            return KeydownOutcome::Ignored;
        };

        if let Some(rate) = self.execute_command(command, true) {
            log::debug!("Applied {command} in {}: {rate:.1}x", self.address);
            return KeydownOutcome::Applied(rate);
        }
        if self.state.is_top_frame {
            log::debug!("No media for {command} in top frame {}", self.address);
            return KeydownOutcome::Unresolved;
        }

        self.relay_command(command);
        KeydownOutcome::Relayed(command)
    }

    fn relay_command(&self, command: Command) {
        let Some(relay) = &self.relay else {
            log::warn!("No coordinator to relay {command} from {}", self.address);
            return;
        };
        if let Err(err) = relay.send_runtime(self.address, &RuntimeMessage::forward(command)) {
            log::warn!("Failed to relay {command} from {}: {err:?}", self.address);
        }
    }

    pub fn handle_forwarded_command(&mut self, payload: &Value) -> bool {
        if !self.state.is_top_frame {
            log::debug!("Ignoring forwarded command in nested frame {}", self.address);
            return false;
        }
        let Some(RuntimeMessage::ForwardSpeedCommand { command }) = RuntimeMessage::parse(payload)
        else {
            return false;
        };
        let handled = self.apply_command_to_active_video(command, true);
        if !handled {
            log::debug!("Forwarded {command} found no media in {}", self.address);
        }
        handled
    }
}
