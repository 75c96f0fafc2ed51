use std::{collections::HashMap, fmt};

use anyhow::anyhow;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{context::ContextMsg, id_type, messages::RuntimeMessage};

id_type!(TabId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    pub const TOP: Self = Self(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameAddress {
    pub tab: TabId,
    pub frame: FrameId,
}

impl FrameAddress {
    pub fn new(tab: TabId, frame: FrameId) -> Self {
        Self { tab, frame }
    }

    #[cfg(test)]
    pub fn top(tab: TabId) -> Self {
        Self::new(tab, FrameId::TOP)
    }

    pub fn is_top(&self) -> bool {
        self.frame == FrameId::TOP
    }
}

impl fmt::Display for FrameAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.tab, self.frame.0)
    }
}

/// Coordinator-side reference to a document context. Doesn't keep the
/// context's channel alive.
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    pub address: FrameAddress,
    message_tx: mpsc::WeakSender<ContextMsg>,
}

impl DocumentHandle {
    pub fn new(address: FrameAddress, message_tx: &mpsc::Sender<ContextMsg>) -> Self {
        Self {
            address,
            message_tx: message_tx.downgrade(),
        }
    }

    /// Best-effort delivery. `Ok(false)` means the context is gone.
    pub fn deliver(&self, msg: ContextMsg) -> anyhow::Result<bool> {
        let Some(message_tx) = self.message_tx.upgrade() else {
            return Ok(false);
        };
        message_tx
            .try_send(msg)
            .map_err(|err| anyhow!("Failed to deliver to {}: {err}", self.address))?;
        Ok(true)
    }
}

#[derive(Debug)]
pub enum CoordinatorMsg {
    Register(DocumentHandle),
    Unregister(FrameAddress),
    Runtime { sender: FrameAddress, payload: Value },
}

#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    message_tx: mpsc::Sender<CoordinatorMsg>,
}

impl CoordinatorHandle {
    pub async fn register(&self, handle: DocumentHandle) -> anyhow::Result<()> {
        self.message_tx
            .send(CoordinatorMsg::Register(handle))
            .await?;
        Ok(())
    }

    pub async fn unregister(&self, address: FrameAddress) -> anyhow::Result<()> {
        self.message_tx
            .send(CoordinatorMsg::Unregister(address))
            .await?;
        Ok(())
    }

    pub fn send_runtime(
        &self,
        sender: FrameAddress,
        message: &RuntimeMessage,
    ) -> anyhow::Result<()> {
        let payload = message.to_value()?;
        self.message_tx
            .try_send(CoordinatorMsg::Runtime { sender, payload })
            .map_err(|err| anyhow!("Failed to reach the coordinator: {err}"))?;
        Ok(())
    }
}

pub struct Coordinator {
    frames: HashMap<TabId, HashMap<FrameId, DocumentHandle>>,
    message_rx: mpsc::Receiver<CoordinatorMsg>,
}

impl Coordinator {
    const CHANNEL_CAPACITY: usize = 64;

    pub fn create() -> (Self, CoordinatorHandle) {
        let (message_tx, message_rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        let coordinator = Self {
            frames: HashMap::new(),
            message_rx,
        };
        (coordinator, CoordinatorHandle { message_tx })
    }

    pub fn spawn() -> (CoordinatorHandle, JoinHandle<()>) {
        let (mut coordinator, handle) = Self::create();
        let join_handle = tokio::spawn(async move { coordinator.run().await });
        (handle, join_handle)
    }

    pub async fn run(&mut self) {
        while let Some(msg) = self.message_rx.recv().await {
            self.handle_msg(msg);
        }
        log::debug!("Coordinator channel closed");
    }

    #[cfg(test)]
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.message_rx.try_recv() {
            self.handle_msg(msg);
            handled += 1;
        }
        handled
    }

    pub fn handle_msg(&mut self, msg: CoordinatorMsg) {
        match msg {
            CoordinatorMsg::Register(handle) => {
                log::debug!("Registering document {}", handle.address);
                self.frames
                    .entry(handle.address.tab)
                    .or_default()
                    .insert(handle.address.frame, handle);
            }
            CoordinatorMsg::Unregister(address) => {
                log::debug!("Unregistering document {address}");
                if let Some(frames) = self.frames.get_mut(&address.tab) {
                    frames.remove(&address.frame);
                    if frames.is_empty() {
                        self.frames.remove(&address.tab);
                    }
                }
            }
            CoordinatorMsg::Runtime { sender, payload } => {
                self.forward(sender, payload);
            }
        }
    }

    fn forward(&self, sender: FrameAddress, payload: Value) -> bool {
        let Some(RuntimeMessage::ForwardSpeedCommand { command }) = RuntimeMessage::parse(&payload)
        else {
            return false;
        };
        if sender.is_top() {
            log::debug!("Not forwarding {command} from top frame {sender}");
            return false;
        }

        let Some(top) = self
            .frames
            .get(&sender.tab)
            .and_then(|frames| frames.get(&FrameId::TOP))
        else {
            log::warn!("Failed to relay {command} from {sender}: top frame isn't ready");
            return false;
        };

        match top.deliver(ContextMsg::Runtime(payload)) {
            Ok(true) => {
                log::debug!("Relayed {command} from {sender} to {}", top.address);
                true
            }
            Ok(false) => {
                log::warn!("Failed to relay {command} from {sender}: top frame is gone");
                false
            }
            Err(err) => {
                log::warn!("Failed to relay {command} from {sender}: {err:?}");
                false
            }
        }
    }
}
