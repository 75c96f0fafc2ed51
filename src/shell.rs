use std::{fmt::Write as _, sync::Arc};

use anyhow::{anyhow, bail, Context};
use tokio::sync::{mpsc, oneshot};

use crate::{
    context::{ContextMsg, ContextSnapshot},
    coordinator::FrameAddress,
    dom::{Document, NodeId},
    keyboard::{KeyEvent, KeydownOutcome},
    prefs::{PreferenceStore, PreferenceUpdate, ShortcutBindings},
};

// Range the settings form accepts; the store itself clamps to a wider one.
const MIN_PREFERRED_INPUT: f64 = 0.1;
const MAX_PREFERRED_INPUT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
    Play,
    Pause,
    Load,
    Remove,
    Focus,
    Fullscreen,
}

impl MediaAction {
    fn parse(word: &str) -> Option<Self> {
        let action = match word {
            "play" => Self::Play,
            "pause" => Self::Pause,
            "load" => Self::Load,
            "remove" => Self::Remove,
            "focus" => Self::Focus,
            "fullscreen" => Self::Fullscreen,
            _ => return None,
        };
        Some(action)
    }

    fn apply(self, doc: &mut Document, element: NodeId) {
        match self {
            Self::Play => {
                doc.play(element);
            }
            Self::Pause => {
                doc.pause(element);
            }
            Self::Load => {
                doc.load(element);
            }
            Self::Remove => {
                doc.remove(element);
            }
            Self::Focus => {
                doc.focus(element);
            }
            Self::Fullscreen => {
                doc.request_fullscreen(element);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Key {
        frame: usize,
        key: String,
        ctrl: bool,
        meta: bool,
    },
    Type { frame: usize, key: String },
    Write { frame: usize, key: String },
    Media {
        action: MediaAction,
        frame: usize,
        index: usize,
    },
    Add { frame: usize },
    Blur { frame: usize },
    ExitFullscreen { frame: usize },
    Prefer(f64),
    Bind {
        decrease: String,
        increase: String,
        toggle: String,
    },
    Status,
    Quit,
}

fn number<T: std::str::FromStr>(word: Option<&str>, what: &str) -> anyhow::Result<T> {
    let word = word.ok_or_else(|| anyhow!("Missing {what}"))?;
    word.parse()
        .map_err(|_| anyhow!("Invalid {what} '{word}'"))
}

fn word<'a>(word: Option<&'a str>, what: &str) -> anyhow::Result<&'a str> {
    word.ok_or_else(|| anyhow!("Missing {what}"))
}

impl ShellCommand {
    pub fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };

        let command = match name {
            "key" => {
                let frame = number(words.next(), "frame")?;
                let key = word(words.next(), "key")?.to_string();
                let (mut ctrl, mut meta) = (false, false);
                for modifier in words.by_ref() {
                    match modifier {
                        "ctrl" => ctrl = true,
                        "meta" => meta = true,
                        other => bail!("Unknown modifier '{other}'"),
                    }
                }
                Self::Key {
                    frame,
                    key,
                    ctrl,
                    meta,
                }
            }
            "type" => Self::Type {
                frame: number(words.next(), "frame")?,
                key: word(words.next(), "key")?.to_string(),
            },
            "write" => Self::Write {
                frame: number(words.next(), "frame")?,
                key: word(words.next(), "key")?.to_string(),
            },
            "add" => Self::Add {
                frame: number(words.next(), "frame")?,
            },
            "blur" => Self::Blur {
                frame: number(words.next(), "frame")?,
            },
            "exit-fullscreen" => Self::ExitFullscreen {
                frame: number(words.next(), "frame")?,
            },
            "prefer" => Self::Prefer(number(words.next(), "speed")?),
            "bind" => Self::Bind {
                decrease: word(words.next(), "decrease key")?.to_string(),
                increase: word(words.next(), "increase key")?.to_string(),
                toggle: word(words.next(), "toggle key")?.to_string(),
            },
            "status" => Self::Status,
            "quit" | "exit" => Self::Quit,
            other => {
                let action =
                    MediaAction::parse(other).ok_or_else(|| anyhow!("Unknown command '{other}'"))?;
                Self::Media {
                    action,
                    frame: number(words.next(), "frame")?,
                    index: number(words.next(), "media index")?,
                }
            }
        };

        if let Some(extra) = words.next() {
            bail!("Unexpected argument '{extra}'");
        }
        Ok(Some(command))
    }
}

#[derive(Debug, Clone)]
pub struct FrameEntry {
    pub address: FrameAddress,
    pub message_tx: mpsc::Sender<ContextMsg>,
    pub search_box: NodeId,
    pub editor: NodeId,
}

impl FrameEntry {
    async fn send(&self, msg: ContextMsg) -> anyhow::Result<()> {
        self.message_tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("Document {} is no longer running", self.address))
    }

    async fn mutate(
        &self,
        mutation: impl FnOnce(&mut Document) + Send + 'static,
    ) -> anyhow::Result<()> {
        self.send(ContextMsg::Mutate(Box::new(mutation))).await
    }

    pub async fn keydown(&self, event: KeyEvent) -> anyhow::Result<KeydownOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ContextMsg::Keydown {
            event,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx
            .await
            .with_context(|| format!("Document {} didn't answer", self.address))
    }

    pub async fn snapshot(&self) -> anyhow::Result<ContextSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ContextMsg::Inspect(reply_tx)).await?;
        reply_rx
            .await
            .with_context(|| format!("Document {} didn't answer", self.address))
    }
}

pub struct Shell {
    frames: Vec<FrameEntry>,
    store: Arc<PreferenceStore>,
}

impl Shell {
    pub fn new(frames: Vec<FrameEntry>, store: Arc<PreferenceStore>) -> Self {
        Self { frames, store }
    }

    pub fn frames(&self) -> &[FrameEntry] {
        &self.frames
    }

    fn frame(&self, index: usize) -> anyhow::Result<&FrameEntry> {
        self.frames
            .get(index)
            .ok_or_else(|| anyhow!("No frame {index}; there are {}", self.frames.len()))
    }

    pub async fn shutdown(&self) {
        for frame in &self.frames {
            if let Err(err) = frame.send(ContextMsg::Teardown).await {
                log::warn!("{err:#}");
            }
        }
    }

    async fn press(&self, index: usize, event: KeyEvent) -> anyhow::Result<()> {
        let frame = self.frame(index)?;
        let outcome = frame.keydown(event).await?;
        println!("frame {}: {}", frame.address, describe_outcome(outcome));
        Ok(())
    }

    /// Returns false when the shell should stop.
    pub async fn execute(&self, command: ShellCommand) -> anyhow::Result<bool> {
        match command {
            ShellCommand::Key {
                frame,
                key,
                ctrl,
                meta,
            } => {
                let mut event = KeyEvent::from_key(&key);
                if ctrl {
                    event = event.with_ctrl();
                }
                if meta {
                    event = event.with_meta();
                }
                self.press(frame, event).await?;
            }
            ShellCommand::Type { frame, key } => {
                let target = self.frame(frame)?.search_box;
                self.press(frame, KeyEvent::from_key(&key).with_target(target))
                    .await?;
            }
            ShellCommand::Write { frame, key } => {
                let target = self.frame(frame)?.editor;
                self.press(frame, KeyEvent::from_key(&key).with_target(target))
                    .await?;
            }
            ShellCommand::Blur { frame } => {
                self.frame(frame)?.mutate(Document::blur).await?;
            }
            ShellCommand::Media {
                action,
                frame,
                index,
            } => {
                self.frame(frame)?
                    .mutate(move |doc| match doc.query_media().get(index) {
                        Some(element) => action.apply(doc, *element),
                        None => log::warn!("No media element {index}"),
                    })
                    .await?;
            }
            ShellCommand::Add { frame } => {
                self.frame(frame)?
                    .mutate(|doc| {
                        let video = doc.create_video(1.0, true);
                        doc.append_child(doc.body(), video);
                    })
                    .await?;
            }
            ShellCommand::ExitFullscreen { frame } => {
                self.frame(frame)?
                    .mutate(|doc| {
                        doc.exit_fullscreen();
                    })
                    .await?;
            }
            ShellCommand::Prefer(speed) => {
                if !(MIN_PREFERRED_INPUT..=MAX_PREFERRED_INPUT).contains(&speed) {
                    bail!(
                        "Please enter a speed between {MIN_PREFERRED_INPUT:.1} and {MAX_PREFERRED_INPUT:.1}"
                    );
                }
                let preferences = self
                    .store
                    .set(PreferenceUpdate {
                        preferred_speed: Some(speed),
                        ..Default::default()
                    })
                    .await?;
                log::info!("Preferred speed is now {:.1}", preferences.preferred_speed);
            }
            ShellCommand::Bind {
                decrease,
                increase,
                toggle,
            } => {
                let shortcuts = ShortcutBindings::parse(&decrease, &increase, &toggle)?;
                self.store
                    .set(PreferenceUpdate {
                        shortcuts: Some(shortcuts),
                        ..Default::default()
                    })
                    .await?;
                log::info!("Shortcut keys are now {decrease} {increase} {toggle}");
            }
            ShellCommand::Status => {
                for frame in &self.frames {
                    println!("{}", format_snapshot(&frame.snapshot().await?));
                }
            }
            ShellCommand::Quit => return Ok(false),
        }
        Ok(true)
    }
}

pub fn describe_outcome(outcome: KeydownOutcome) -> String {
    let action = match outcome {
        KeydownOutcome::Ignored => "ignored".to_string(),
        KeydownOutcome::Applied(rate) => format!("applied, now {rate:.1}x"),
        KeydownOutcome::Relayed(command) => format!("relayed {command} to the top frame"),
        KeydownOutcome::Unresolved => "no media to control".to_string(),
    };
    if outcome.is_suppressed() {
        format!("{action} (default suppressed)")
    } else {
        format!("{action} (passed to the page)")
    }
}

pub fn format_snapshot(snapshot: &ContextSnapshot) -> String {
    let mut out = format!(
        "frame {} (preferred {:.1}x, {} listener(s){})",
        snapshot.address,
        snapshot.preferred_speed,
        snapshot.listeners,
        if snapshot.observing { "" } else { ", stopped" }
    );
    if snapshot.media.is_empty() {
        out.push_str(": no media");
    }
    for (index, media) in snapshot.media.iter().enumerate() {
        let _ = write!(
            out,
            "\n  [{index}] {:.2}x {}{}{}",
            media.playback_rate,
            if media.paused { "paused" } else { "playing" },
            match (&media.label, media.highlighted) {
                (Some(label), true) => format!(" overlay {label} (highlighted)"),
                (Some(label), false) => format!(" overlay {label}"),
                (None, _) => String::new(),
            },
            match media.remembered_rate {
                Some(rate) => format!(", remembers {rate:.2}x"),
                None => String::new(),
            }
        );
    }
    out
}
