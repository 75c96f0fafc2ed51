use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

use crate::{
    dom::{AbortSignal, Document, DomEvent, EventKind, MutationRecord, NodeId},
    overlay::OverlayManager,
    speed::SpeedController,
};

#[derive(Debug)]
pub struct ListenerBundle {
    signal: AbortSignal,
}

impl ListenerBundle {
    const EVENTS: [EventKind; 3] = [EventKind::RateChange, EventKind::Play, EventKind::Pause];

    fn attach(doc: &mut Document, element: NodeId) -> Self {
        let signal = doc.new_abort_signal();
        for kind in Self::EVENTS {
            doc.add_listener(element, kind, signal);
        }
        Self { signal }
    }

    pub fn dispose(self, doc: &mut Document) -> usize {
        doc.abort(self.signal)
    }
}

#[derive(Debug, Default)]
pub struct MediaTracker {
    tracked: HashSet<NodeId>,
    bundles: HashMap<NodeId, ListenerBundle>,
    speed: SpeedController,
}

impl MediaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked(&self) -> &HashSet<NodeId> {
        &self.tracked
    }

    pub fn is_tracked(&self, element: NodeId) -> bool {
        self.tracked.contains(&element)
    }

    pub fn speed(&self) -> &SpeedController {
        &self.speed
    }

    pub fn speed_mut(&mut self) -> &mut SpeedController {
        &mut self.speed
    }

    pub fn reconcile(&mut self, doc: &mut Document, overlays: &mut OverlayManager) {
        let present = doc.query_media();
        let present_set: HashSet<NodeId> = present.iter().copied().collect();

        for element in present {
            if !self.tracked.contains(&element) {
                self.attach(doc, overlays, element);
            }
        }

        let vanished: Vec<NodeId> = self.tracked.difference(&present_set).copied().collect();
        for element in vanished {
            self.detach(doc, overlays, element);
        }

        self.tracked = present_set;
    }

    fn attach(&mut self, doc: &mut Document, overlays: &mut OverlayManager, element: NodeId) {
        if !self.bundles.contains_key(&element) {
            log::debug!("Tracking media element {element}");
            self.bundles
                .insert(element, ListenerBundle::attach(doc, element));
        }
        if let Some(rate) = doc.playback_rate(element) {
            self.speed.record_if_absent(element, rate);
        }
        refresh_overlay(doc, overlays, element);
        self.tracked.insert(element);
    }

    fn detach(&mut self, doc: &mut Document, overlays: &mut OverlayManager, element: NodeId) {
        log::debug!("No longer tracking media element {element}");
        if let Some(bundle) = self.bundles.remove(&element) {
            bundle.dispose(doc);
        }
        overlays.remove_overlay(doc, element);
        self.speed.forget(element);
        self.tracked.remove(&element);
    }

    pub fn handle_mutations(
        &mut self,
        doc: &mut Document,
        overlays: &mut OverlayManager,
        records: &[MutationRecord],
    ) -> bool {
        let touches_media = records.iter().any(|record| {
            record
                .added
                .iter()
                .chain(&record.removed)
                .any(|node| doc.subtree_has_media(*node))
        });
        if !touches_media {
            return false;
        }
        self.reconcile(doc, overlays);

        // A moved element is still present, so the diff above misses it.
        let moved: Vec<NodeId> = self
            .tracked
            .iter()
            .copied()
            .filter(|element| {
                records.iter().any(|record| {
                    record
                        .added
                        .iter()
                        .chain(&record.removed)
                        .any(|node| doc.contains(*node, *element))
                })
            })
            .collect();
        for element in moved {
            overlays.ensure_overlay(doc, element);
        }
        true
    }

    pub fn handle_media_event(
        &mut self,
        doc: &mut Document,
        overlays: &mut OverlayManager,
        event: DomEvent,
    ) {
        let element = event.target;
        match event.kind {
            EventKind::RateChange => {
                let Some(rate) = doc.playback_rate(element) else {
                    return;
                };
                self.speed.record(element, rate);
                refresh_overlay(doc, overlays, element);
            }
            EventKind::Play => {
                self.speed.restore_speed(doc, Some(element));
                refresh_overlay(doc, overlays, element);
            }
            EventKind::Pause => refresh_overlay(doc, overlays, element),
            _ => {}
        }
    }

    // Document-level capture of playback lifecycle events, which catches
    // elements that appeared without a structural change being observed.
    pub fn handle_document_media_event(
        &mut self,
        doc: &mut Document,
        overlays: &mut OverlayManager,
        event: DomEvent,
    ) {
        let element = event.target;
        if !doc.is_media(element) {
            return;
        }
        if !self.is_tracked(element) {
            self.reconcile(doc, overlays);
        }
        if event.kind == EventKind::Play {
            self.speed.restore_speed(doc, Some(element));
        }
    }

    pub fn find_active_video(&self, doc: &Document) -> Option<NodeId> {
        let media = doc.query_media();
        match media.as_slice() {
            [] => None,
            [only] => Some(*only),
            [first, ..] => {
                let focused = doc.active_element().and_then(|active| {
                    media
                        .iter()
                        .find(|element| doc.contains(**element, active))
                        .copied()
                });
                let playing = || {
                    media
                        .iter()
                        .find(|element| doc.is_paused(**element) == Some(false))
                        .copied()
                };
                focused.or_else(playing).or(Some(*first))
            }
        }
    }

    pub fn stop(&mut self, doc: &mut Document, overlays: &mut OverlayManager) {
        let elements: Vec<NodeId> = self
            .tracked
            .iter()
            .chain(self.bundles.keys())
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for element in elements {
            self.detach(doc, overlays, element);
        }
    }
}

fn refresh_overlay(doc: &mut Document, overlays: &mut OverlayManager, element: NodeId) {
    if let Some(rate) = doc.playback_rate(element) {
        overlays.update_speed(doc, element, rate, false, Instant::now());
    }
}
