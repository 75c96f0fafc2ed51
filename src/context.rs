use std::{fmt, sync::Arc, time::Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    coordinator::{CoordinatorHandle, FrameAddress},
    dom::{AbortSignal, Document, DomEvent, EventKind, NodeId},
    keyboard::{KeyEvent, KeydownOutcome},
    overlay::OverlayManager,
    prefs::{
        clamp_to_range, PreferenceChange, PreferenceStore, Preferences, ShortcutBindings,
        PREFERRED_SPEED_KEY, SHORTCUT_KEYS_KEY,
    },
    tracker::MediaTracker,
    utils::finite_number,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ContentState {
    pub preferred_speed: f64,
    pub shortcuts: ShortcutBindings,
    pub is_top_frame: bool,
}

impl ContentState {
    pub fn new(preferences: Preferences, is_top_frame: bool) -> Self {
        Self {
            preferred_speed: clamp_to_range(preferences.preferred_speed),
            shortcuts: preferences.shortcuts,
            is_top_frame,
        }
    }

    pub fn reload(&mut self, preferences: Preferences) {
        self.preferred_speed = clamp_to_range(preferences.preferred_speed);
        self.shortcuts = preferences.shortcuts;
    }

    pub fn apply_change(&mut self, change: &PreferenceChange) -> bool {
        match change.key.as_str() {
            PREFERRED_SPEED_KEY => {
                let Some(speed) = finite_number(&change.new_value) else {
                    log::warn!("Ignoring non-numeric preferred speed {}", change.new_value);
                    return false;
                };
                self.preferred_speed = clamp_to_range(speed);
                true
            }
            SHORTCUT_KEYS_KEY => match ShortcutBindings::from_value(&change.new_value) {
                Ok(shortcuts) => {
                    self.shortcuts = shortcuts;
                    true
                }
                Err(err) => {
                    log::warn!("Keeping previous shortcut keys: {err:#}");
                    false
                }
            },
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSnapshot {
    pub element: NodeId,
    pub playback_rate: f64,
    pub paused: bool,
    pub label: Option<String>,
    pub highlighted: bool,
    pub remembered_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnapshot {
    pub address: FrameAddress,
    pub preferred_speed: f64,
    pub observing: bool,
    pub listeners: usize,
    pub media: Vec<MediaSnapshot>,
}

pub type DocumentMutation = Box<dyn FnOnce(&mut Document) + Send>;

pub enum ContextMsg {
    Keydown {
        event: KeyEvent,
        reply: Option<oneshot::Sender<KeydownOutcome>>,
    },
    Runtime(Value),
    Mutate(DocumentMutation),
    Inspect(oneshot::Sender<ContextSnapshot>),
    Teardown,
}

impl fmt::Debug for ContextMsg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Keydown { event, .. } => f.debug_struct("Keydown").field("event", event).finish(),
            Self::Runtime(payload) => f.debug_tuple("Runtime").field(payload).finish(),
            Self::Mutate(_) => f.write_str("Mutate(..)"),
            Self::Inspect(_) => f.write_str("Inspect(..)"),
            Self::Teardown => f.write_str("Teardown"),
        }
    }
}

pub struct DocumentContext {
    pub(crate) address: FrameAddress,
    pub(crate) document: Document,
    pub(crate) tracker: MediaTracker,
    pub(crate) overlays: OverlayManager,
    pub(crate) state: ContentState,
    pub(crate) relay: Option<CoordinatorHandle>,
    document_signal: Option<AbortSignal>,
}

impl DocumentContext {
    const DOCUMENT_EVENTS: [EventKind; 4] = [
        EventKind::FullscreenChange,
        EventKind::Play,
        EventKind::LoadedMetadata,
        EventKind::Keydown,
    ];

    pub fn new(
        address: FrameAddress,
        document: Document,
        preferences: Preferences,
        relay: Option<CoordinatorHandle>,
    ) -> Self {
        Self {
            address,
            document,
            tracker: MediaTracker::new(),
            overlays: OverlayManager::new(),
            state: ContentState::new(preferences, address.is_top()),
            relay,
            document_signal: None,
        }
    }

    pub async fn initialize(
        address: FrameAddress,
        document: Document,
        store: &PreferenceStore,
        relay: Option<CoordinatorHandle>,
    ) -> Self {
        let preferences = store.get().await.unwrap_or_else(|err| {
            log::error!("Failed to load preferences for {address}: {err:?}");
            Preferences::default()
        });
        Self::new(address, document, preferences, relay)
    }

    pub fn address(&self) -> FrameAddress {
        self.address
    }

    pub fn is_started(&self) -> bool {
        self.document_signal.is_some()
    }

    pub fn start(&mut self) {
        if self.is_started() {
            return;
        }
        self.tracker
            .reconcile(&mut self.document, &mut self.overlays);
        self.document.observe();

        let signal = self.document.new_abort_signal();
        let root = self.document.root();
        for kind in Self::DOCUMENT_EVENTS {
            self.document.add_listener(root, kind, signal);
        }
        self.document_signal = Some(signal);

        log::info!(
            "Document {} started with {} media element(s)",
            self.address,
            self.tracker.tracked().len()
        );
        self.pump();
    }

    pub fn teardown(&mut self) {
        let Some(signal) = self.document_signal.take() else {
            return;
        };
        self.tracker.stop(&mut self.document, &mut self.overlays);
        self.document.disconnect_observer();
        self.document.abort(signal);
        // Drain whatever the teardown itself queued.
        while self.document.pop_event().is_some() {}
        log::info!("Document {} torn down", self.address);
    }

    pub fn pump(&mut self) {
        loop {
            let records = self.document.take_mutations();
            if !records.is_empty() {
                self.tracker
                    .handle_mutations(&mut self.document, &mut self.overlays, &records);
                continue;
            }
            let Some(event) = self.document.pop_event() else {
                break;
            };
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: DomEvent) {
        let root = self.document.root();
        match event.kind {
            EventKind::FullscreenChange => {
                if self.document.listener_count(root, event.kind) > 0 {
                    self.overlays.handle_fullscreen_change(&mut self.document);
                }
            }
            EventKind::Keydown => {}
            kind => {
                if matches!(kind, EventKind::Play | EventKind::LoadedMetadata)
                    && self.document.listener_count(root, kind) > 0
                {
                    self.tracker.handle_document_media_event(
                        &mut self.document,
                        &mut self.overlays,
                        event,
                    );
                }
                for _ in 0..self.document.listener_count(event.target, kind) {
                    self.tracker
                        .handle_media_event(&mut self.document, &mut self.overlays, event);
                }
            }
        }
    }

    pub fn apply_preference_change(&mut self, change: &PreferenceChange) -> bool {
        self.state.apply_change(change)
    }

    pub fn expire_highlights(&mut self, now: Instant) -> usize {
        self.overlays.expire_highlights(&mut self.document, now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.overlays.next_deadline()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let media = self
            .document
            .query_media()
            .into_iter()
            .filter_map(|element| {
                let media = self.document.media(element)?;
                Some(MediaSnapshot {
                    element,
                    playback_rate: media.playback_rate,
                    paused: media.paused,
                    label: self
                        .overlays
                        .label_text(&self.document, element)
                        .map(str::to_string),
                    highlighted: self.overlays.is_highlighted(element),
                    remembered_rate: self.tracker.speed().last_rate(element),
                })
            })
            .collect();
        ContextSnapshot {
            address: self.address,
            preferred_speed: self.state.preferred_speed,
            observing: self.document.is_observing(),
            listeners: self.document.total_listeners(),
            media,
        }
    }

    /// Handles one inbound message. Returns false once the context is done.
    pub fn handle_msg(&mut self, msg: ContextMsg) -> bool {
        match msg {
            ContextMsg::Keydown { event, reply } => {
                let outcome = self.handle_keydown(&event);
                log::debug!(
                    "Keydown {:?} in {}: {outcome:?} (suppressed: {})",
                    event.key,
                    self.address,
                    outcome.is_suppressed()
                );
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            ContextMsg::Runtime(payload) => {
                self.handle_forwarded_command(&payload);
            }
            ContextMsg::Mutate(mutation) => {
                mutation(&mut self.document);
                self.pump();
            }
            ContextMsg::Inspect(reply) => {
                if reply.send(self.snapshot()).is_err() {
                    log::debug!("Snapshot requester for {} went away", self.address);
                }
            }
            ContextMsg::Teardown => {
                self.teardown();
                return false;
            }
        }
        true
    }

    async fn reload_preferences(&mut self, store: &PreferenceStore) {
        match store.get().await {
            Ok(preferences) => self.state.reload(preferences),
            Err(err) => log::error!("Failed to reload preferences for {}: {err:?}", self.address),
        }
    }

    async fn handle_preference_event(
        &mut self,
        event: Result<PreferenceChange, broadcast::error::RecvError>,
        store: &PreferenceStore,
    ) -> bool {
        match event {
            Ok(change) => {
                self.apply_preference_change(&change);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!(
                    "{} missed {skipped} preference change(s); reloading",
                    self.address
                );
                self.reload_preferences(store).await;
            }
            Err(broadcast::error::RecvError::Closed) => return false,
        }
        true
    }

    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<ContextMsg>,
        mut preferences: broadcast::Receiver<PreferenceChange>,
        store: Arc<PreferenceStore>,
    ) {
        self.start();
        let mut preferences_open = true;

        loop {
            let deadline = self.next_deadline();
            let sleep_target =
                tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                msg = messages.recv() => {
                    let Some(msg) = msg else {
                        log::debug!("Message channel of {} closed", self.address);
                        break;
                    };
                    if !self.handle_msg(msg) {
                        break;
                    }
                }
                event = preferences.recv(), if preferences_open => {
                    preferences_open = self.handle_preference_event(event, &store).await;
                }
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    self.expire_highlights(Instant::now());
                }
            }
        }

        self.teardown();
    }
}

#[cfg(test)]
impl DocumentContext {
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn tracker(&self) -> &MediaTracker {
        &self.tracker
    }

    pub fn overlays(&self) -> &OverlayManager {
        &self.overlays
    }

    pub fn state(&self) -> &ContentState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::{
        coordinator::{Coordinator, CoordinatorMsg, DocumentHandle, FrameId, TabId},
        prefs::{PreferenceUpdate, MAX_SPEED},
    };

    use super::*;

    fn document_with_video(rate: f64) -> (Document, NodeId) {
        let mut doc = Document::new();
        let video = doc.create_video(rate, true);
        doc.append_child(doc.body(), video);
        (doc, video)
    }

    fn top_context(doc: Document) -> DocumentContext {
        let mut ctx = DocumentContext::new(
            FrameAddress::top(TabId::new()),
            doc,
            Preferences::default(),
            None,
        );
        ctx.start();
        ctx
    }

    #[test]
    fn should_update_preferred_speed_from_finite_numbers_only() {
        // given
        let mut state = ContentState::new(Preferences::default(), true);

        // when
        let accepted = state.apply_change(&PreferenceChange {
            key: PREFERRED_SPEED_KEY.to_string(),
            new_value: json!(40.0),
        });
        let rejected = state.apply_change(&PreferenceChange {
            key: PREFERRED_SPEED_KEY.to_string(),
            new_value: json!("2.0"),
        });

        // then
        assert!(accepted);
        assert!(!rejected);
        assert_eq!(state.preferred_speed, MAX_SPEED);
    }

    #[test]
    fn should_keep_previous_bindings_when_duplicated() {
        // given
        let mut state = ContentState::new(Preferences::default(), true);
        state.apply_change(&PreferenceChange {
            key: SHORTCUT_KEYS_KEY.to_string(),
            new_value: json!({ "decrease": "a", "increase": "s", "toggle": "d" }),
        });

        // when
        let applied = state.apply_change(&PreferenceChange {
            key: SHORTCUT_KEYS_KEY.to_string(),
            new_value: json!({ "decrease": "x", "increase": "x", "toggle": "d" }),
        });

        // then
        assert!(!applied);
        assert_eq!(
            state.shortcuts,
            ShortcutBindings {
                decrease: 'a',
                increase: 's',
                toggle: 'd'
            }
        );
    }

    #[test]
    fn should_ignore_unknown_keys() {
        // given
        let mut state = ContentState::new(Preferences::default(), true);

        // when
        let applied = state.apply_change(&PreferenceChange {
            key: "theme".to_string(),
            new_value: json!("dark"),
        });

        // then
        assert!(!applied);
        assert_eq!(state, ContentState::new(Preferences::default(), true));
    }

    #[test]
    fn should_tear_down_overlay_and_timer_when_element_is_removed() {
        // given
        let (doc, video) = document_with_video(1.0);
        let mut ctx = top_context(doc);
        ctx.handle_keydown(&KeyEvent::new(".", "Period"));
        assert!(ctx.overlays().is_highlighted(video));
        let root = ctx.overlays().get(video).unwrap().root();

        // when
        ctx.document_mut().remove(video);
        ctx.pump();

        // then
        assert!(ctx.overlays().get(video).is_none());
        assert_eq!(ctx.document().parent(root), None);
        assert_eq!(ctx.next_deadline(), None);
        assert_eq!(
            ctx.expire_highlights(Instant::now() + Duration::from_secs(10)),
            0
        );
    }

    #[test]
    fn should_follow_fullscreen_changes() {
        // given
        let mut doc = Document::new();
        let player = doc.create_element("div");
        let video = doc.create_video(1.0, true);
        doc.append_child(doc.body(), player);
        doc.append_child(player, video);
        let mut ctx = top_context(doc);
        let root = ctx.overlays().get(video).unwrap().root();
        assert_eq!(ctx.document().parent(root), Some(ctx.document().body()));

        // when
        ctx.document_mut().request_fullscreen(player);
        ctx.pump();

        // then
        assert_eq!(ctx.document().parent(root), Some(player));
        assert_eq!(ctx.document().style(root, "position"), Some("fixed"));

        // when
        ctx.document_mut().exit_fullscreen();
        ctx.pump();

        // then
        assert_eq!(ctx.document().parent(root), Some(ctx.document().body()));
        assert_eq!(ctx.document().style(root, "position"), Some("absolute"));
    }

    #[test]
    fn should_track_media_added_after_start() {
        // given
        let mut ctx = top_context(Document::new());
        assert!(ctx.tracker().tracked().is_empty());

        // when
        let doc = ctx.document_mut();
        let video = doc.create_video(1.0, true);
        doc.append_child(doc.body(), video);
        ctx.pump();

        // then
        assert!(ctx.tracker().is_tracked(video));
        assert_eq!(ctx.snapshot().media[0].label.as_deref(), Some("1.0x"));
    }

    #[test]
    fn should_release_all_listeners_on_teardown() {
        // given
        let (doc, _) = document_with_video(1.0);
        let mut ctx = top_context(doc);
        assert!(ctx.document().total_listeners() > 0);

        // when
        ctx.teardown();
        ctx.teardown();

        // then
        assert_eq!(ctx.document().total_listeners(), 0);
        assert!(!ctx.document().is_observing());
        assert!(ctx.overlays().is_empty());
    }

    #[test]
    fn should_apply_relayed_command_once_in_top_frame_only() {
        // given
        let (mut coordinator, relay) = Coordinator::create();
        let tab = TabId::new();

        let (top_doc, top_video) = document_with_video(1.0);
        let mut top = DocumentContext::new(
            FrameAddress::top(tab),
            top_doc,
            Preferences::default(),
            Some(relay.clone()),
        );
        top.start();
        let (top_tx, mut top_rx) = mpsc::channel(8);

        let mut child = DocumentContext::new(
            FrameAddress::new(tab, FrameId(1)),
            Document::new(),
            Preferences::default(),
            Some(relay.clone()),
        );
        child.start();
        let (child_tx, mut child_rx) = mpsc::channel(8);

        let (sibling_doc, sibling_video) = document_with_video(1.0);
        let mut sibling = DocumentContext::new(
            FrameAddress::new(tab, FrameId(2)),
            sibling_doc,
            Preferences::default(),
            Some(relay),
        );
        sibling.start();
        let (sibling_tx, mut sibling_rx) = mpsc::channel(8);

        for (ctx, tx) in [(&top, &top_tx), (&child, &child_tx), (&sibling, &sibling_tx)] {
            coordinator.handle_msg(CoordinatorMsg::Register(DocumentHandle::new(
                ctx.address(),
                tx,
            )));
        }

        // when
        let outcome = child.handle_keydown(&KeyEvent::new(".", "Period"));
        coordinator.process_pending();
        while let Ok(msg) = top_rx.try_recv() {
            top.handle_msg(msg);
        }

        // then
        assert_eq!(
            outcome,
            KeydownOutcome::Relayed(crate::messages::Command::Increase)
        );
        let rate = top.document().playback_rate(top_video).unwrap();
        assert!((rate - 1.1).abs() < 1e-9);
        assert!(top.overlays().is_highlighted(top_video));
        assert!(child_rx.try_recv().is_err());
        assert!(sibling_rx.try_recv().is_err());
        assert_eq!(sibling.document().playback_rate(sibling_video), Some(1.0));
    }

    #[tokio::test]
    async fn should_run_relay_end_to_end() {
        // given
        let store = Arc::new(PreferenceStore::in_memory());
        let (relay, _coordinator_task) = Coordinator::spawn();
        let tab = TabId::new();

        let (top_doc, _) = document_with_video(1.0);
        let top_address = FrameAddress::top(tab);
        let top = DocumentContext::initialize(top_address, top_doc, &store, Some(relay.clone()))
            .await;
        let (top_tx, top_rx) = mpsc::channel(8);
        relay
            .register(DocumentHandle::new(top_address, &top_tx))
            .await
            .unwrap();
        tokio::spawn(top.run(top_rx, store.subscribe(), Arc::clone(&store)));

        let child_address = FrameAddress::new(tab, FrameId(1));
        let child =
            DocumentContext::initialize(child_address, Document::new(), &store, Some(relay.clone()))
                .await;
        let (child_tx, child_rx) = mpsc::channel(8);
        relay
            .register(DocumentHandle::new(child_address, &child_tx))
            .await
            .unwrap();
        tokio::spawn(child.run(child_rx, store.subscribe(), Arc::clone(&store)));

        // when
        let (outcome_tx, outcome_rx) = oneshot::channel();
        child_tx
            .send(ContextMsg::Keydown {
                event: KeyEvent::new("r", "KeyR"),
                reply: Some(outcome_tx),
            })
            .await
            .unwrap();

        // then
        assert_eq!(
            outcome_rx.await.unwrap(),
            KeydownOutcome::Relayed(crate::messages::Command::Toggle)
        );
        let mut rate = 0.0;
        for _ in 0..100 {
            let (reply_tx, reply_rx) = oneshot::channel();
            top_tx.send(ContextMsg::Inspect(reply_tx)).await.unwrap();
            rate = reply_rx.await.unwrap().media[0].playback_rate;
            if rate != 1.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rate, 1.8);

        top_tx.send(ContextMsg::Teardown).await.unwrap();
        child_tx.send(ContextMsg::Teardown).await.unwrap();
    }

    #[tokio::test]
    async fn should_reload_preferences_after_missing_changes() {
        // given
        let store = PreferenceStore::in_memory();
        let mut changes = store.subscribe();
        let (doc, _) = document_with_video(1.0);
        let mut ctx = top_context(doc);
        let bindings = ShortcutBindings::parse("a", "s", "d").unwrap();
        store
            .set(PreferenceUpdate {
                shortcuts: Some(bindings),
                ..Default::default()
            })
            .await
            .unwrap();
        for step in 0..40 {
            store
                .set(PreferenceUpdate {
                    preferred_speed: Some(1.0 + f64::from(step) * 0.01),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        // when
        let event = changes.recv().await;
        let open = ctx.handle_preference_event(event, &store).await;

        // then
        assert!(open);
        assert_eq!(ctx.state().shortcuts, bindings);
        assert!((ctx.state().preferred_speed - 1.39).abs() < 1e-9);
        assert!(matches!(
            ctx.handle_keydown(&KeyEvent::from_key("s")),
            KeydownOutcome::Applied(_)
        ));
    }

    #[test]
    fn should_report_listeners_and_remembered_rate_in_snapshot() {
        // given
        let (doc, _) = document_with_video(1.0);
        let mut ctx = top_context(doc);
        ctx.handle_keydown(&KeyEvent::from_key("."));

        // when
        let snapshot = ctx.snapshot();

        // then
        assert!(snapshot.observing);
        assert_eq!(snapshot.listeners, 7);
        let remembered = snapshot.media[0].remembered_rate.unwrap();
        assert!((remembered - 1.1).abs() < 1e-9);
    }
}
