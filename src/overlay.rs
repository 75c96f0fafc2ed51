use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::dom::{Document, NodeId};

pub const OVERLAY_TIMEOUT: Duration = Duration::from_millis(1200);

const ROOT_CLASS: &str = "vsc-overlay-root";
const LABEL_CLASS: &str = "vsc-overlay";
const HIGHLIGHT_CLASS: &str = "highlight";
const TOP_MOST: &str = "2147483647";

const OVERLAY_CSS: &str = "\
.vsc-overlay { position: absolute; top: 10px; left: 10px; padding: 4px 8px; \
border-radius: 4px; font-size: 13px; font-weight: 600; pointer-events: none; \
user-select: none; white-space: nowrap; opacity: 0.5; transition: opacity 0.2s ease; }
.vsc-overlay.highlight { opacity: 0.85; transform: scale(1.05); }";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    Fixed,
    Absolute,
}

impl PositionMode {
    fn current(doc: &Document) -> Self {
        if doc.fullscreen_element().is_some() {
            Self::Fixed
        } else {
            Self::Absolute
        }
    }

    fn css(self) -> (&'static str, &'static str) {
        match self {
            Self::Fixed => ("fixed", "10px"),
            Self::Absolute => ("absolute", "0"),
        }
    }
}

#[derive(Debug)]
pub struct Overlay {
    root: NodeId,
    label: NodeId,
    fade_deadline: Option<Instant>,
}

impl Overlay {
    fn create(doc: &mut Document) -> Self {
        let root = doc.create_element("div");
        doc.add_class(root, ROOT_CLASS);
        doc.attach_shadow(root);

        let style = doc.create_element("style");
        doc.set_text(style, OVERLAY_CSS);
        let label = doc.create_element("div");
        doc.add_class(label, LABEL_CLASS);

        doc.append_child(root, style);
        doc.append_child(root, label);

        Self {
            root,
            label,
            fade_deadline: None,
        }
    }

    #[cfg(test)]
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn label(&self) -> NodeId {
        self.label
    }

    pub fn is_highlighted(&self) -> bool {
        self.fade_deadline.is_some()
    }
}

pub fn positioning_container(doc: &Document, element: NodeId) -> NodeId {
    if let Some(fullscreen) = doc.fullscreen_element() {
        if fullscreen == element {
            return doc.parent(element).unwrap_or(doc.body());
        }
        if doc.contains(fullscreen, element) {
            return fullscreen;
        }
    }

    doc.ancestors(element)
        .take_while(|ancestor| *ancestor != doc.body())
        .find(|ancestor| doc.position(*ancestor).is_positioned())
        .unwrap_or(doc.body())
}

#[derive(Debug)]
pub struct OverlayManager {
    overlays: HashMap<NodeId, Overlay>,
    fade_after: Duration,
}

impl Default for OverlayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayManager {
    pub fn new() -> Self {
        Self::with_timeout(OVERLAY_TIMEOUT)
    }

    pub fn with_timeout(fade_after: Duration) -> Self {
        Self {
            overlays: HashMap::new(),
            fade_after,
        }
    }

    pub fn get(&self, element: NodeId) -> Option<&Overlay> {
        self.overlays.get(&element)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn label_text<'a>(&self, doc: &'a Document, element: NodeId) -> Option<&'a str> {
        doc.text(self.get(element)?.label)
    }

    pub fn is_highlighted(&self, element: NodeId) -> bool {
        self.get(element).is_some_and(Overlay::is_highlighted)
    }

    pub fn ensure_overlay(&mut self, doc: &mut Document, element: NodeId) -> Option<&Overlay> {
        if !doc.is_media(element) || !doc.is_connected(element) {
            return None;
        }

        let overlay = self.overlays.entry(element).or_insert_with(|| {
            log::debug!("Creating overlay for {element}");
            Overlay::create(doc)
        });

        let container = positioning_container(doc, element);
        if doc.parent(overlay.root) != Some(container) {
            doc.append_child(container, overlay.root);
        }

        let (position, offset) = PositionMode::current(doc).css();
        doc.set_style(overlay.root, "position", position);
        doc.set_style(overlay.root, "top", offset);
        doc.set_style(overlay.root, "left", offset);
        doc.set_style(overlay.root, "pointer-events", "none");
        doc.set_style(overlay.root, "z-index", TOP_MOST);

        Some(&*overlay)
    }

    pub fn update_speed(
        &mut self,
        doc: &mut Document,
        element: NodeId,
        rate: f64,
        highlight: bool,
        now: Instant,
    ) -> bool {
        let fade_after = self.fade_after;
        let Some(label) = self.ensure_overlay(doc, element).map(Overlay::label) else {
            return false;
        };
        doc.set_text(label, &format!("{rate:.1}x"));

        if !highlight {
            return true;
        }
        doc.add_class(label, HIGHLIGHT_CLASS);
        if let Some(overlay) = self.overlays.get_mut(&element) {
            // Replaces any pending fade; only the latest highlight counts.
            overlay.fade_deadline = Some(now + fade_after);
        }
        true
    }

    pub fn expire_highlights(&mut self, doc: &mut Document, now: Instant) -> usize {
        let mut expired = 0;
        for overlay in self.overlays.values_mut() {
            if overlay.fade_deadline.is_some_and(|deadline| deadline <= now) {
                overlay.fade_deadline = None;
                doc.remove_class(overlay.label, HIGHLIGHT_CLASS);
                expired += 1;
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.overlays
            .values()
            .filter_map(|overlay| overlay.fade_deadline)
            .min()
    }

    pub fn remove_overlay(&mut self, doc: &mut Document, element: NodeId) -> bool {
        let Some(overlay) = self.overlays.remove(&element) else {
            return false;
        };
        doc.remove(overlay.root);
        log::debug!("Removed overlay for {element}");
        true
    }

    pub fn handle_fullscreen_change(&mut self, doc: &mut Document) {
        let elements: Vec<NodeId> = self.overlays.keys().copied().collect();
        for element in elements {
            self.ensure_overlay(doc, element);
        }
    }
}
