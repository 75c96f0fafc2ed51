use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
};

pub const MEDIA_TAG: &str = "video";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Static,
    Relative,
    Absolute,
    Fixed,
    Sticky,
}

impl Position {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "relative" => Self::Relative,
            "absolute" => Self::Absolute,
            "fixed" => Self::Fixed,
            "sticky" => Self::Sticky,
            _ => Self::Static,
        }
    }

    pub fn is_positioned(self) -> bool {
        self != Self::Static
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaState {
    pub playback_rate: f64,
    pub paused: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            playback_rate: 1.0,
            paused: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RateChange,
    Play,
    Pause,
    LoadedMetadata,
    FullscreenChange,
    Keydown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomEvent {
    pub target: NodeId,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationRecord {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbortSignal(u64);

#[derive(Debug)]
struct Listener {
    target: NodeId,
    kind: EventKind,
    signal: AbortSignal,
}

#[derive(Debug, Default)]
struct Node {
    tag: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    style: BTreeMap<String, String>,
    classes: BTreeSet<String>,
    text: String,
    content_editable: bool,
    shadow_root: bool,
    media: Option<MediaState>,
}

/// In-memory element tree standing in for a browser document.
///
/// Nodes are never freed: a removed node keeps its id and subtree, so stale
/// handles stay valid to query but are no longer connected.
#[derive(Debug)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    body: NodeId,
    active_element: Option<NodeId>,
    fullscreen_element: Option<NodeId>,
    observing: bool,
    mutations: Vec<MutationRecord>,
    events: VecDeque<DomEvent>,
    listeners: Vec<Listener>,
    next_signal: u64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            root: NodeId(0),
            body: NodeId(0),
            active_element: None,
            fullscreen_element: None,
            observing: false,
            mutations: Vec::new(),
            events: VecDeque::new(),
            listeners: Vec::new(),
            next_signal: 0,
        };
        doc.root = doc.create_element("html");
        doc.body = doc.create_element("body");
        doc.append_child(doc.root, doc.body);
        doc
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    pub fn exists(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            tag: tag.to_ascii_lowercase(),
            ..Node::default()
        });
        if tag.eq_ignore_ascii_case(MEDIA_TAG) {
            self.nodes[id.0].media = Some(MediaState::default());
        }
        id
    }

    pub fn create_video(&mut self, playback_rate: f64, paused: bool) -> NodeId {
        let id = self.create_element(MEDIA_TAG);
        self.nodes[id.0].media = Some(MediaState {
            playback_rate,
            paused,
        });
        id
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.node(id).map(|node| node.tag.as_str())
    }

    pub fn is_media(&self, id: NodeId) -> bool {
        self.node(id).is_some_and(|node| node.media.is_some())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?.parent
    }

    #[cfg(test)]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|node| node.children.as_slice()).unwrap_or(&[])
    }

    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), |parent| self.parent(*parent))
    }

    /// Whether `inner` is `outer` or one of its descendants.
    pub fn contains(&self, outer: NodeId, inner: NodeId) -> bool {
        outer == inner || self.ancestors(inner).any(|ancestor| ancestor == outer)
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.exists(id) && self.contains(self.root, id)
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        if !self.exists(parent) || !self.exists(child) || child == self.root {
            return false;
        }
        if self.contains(child, parent) {
            log::debug!("Refusing to append {child} into its own subtree");
            return false;
        }
        if self.parent(child).is_some() {
            self.remove(child);
        }

        self.nodes[parent.0].children.push(child);
        self.nodes[child.0].parent = Some(parent);

        if self.observing && self.is_connected(parent) {
            self.mutations.push(MutationRecord {
                added: vec![child],
                removed: Vec::new(),
            });
        }
        true
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        let Some(parent) = self.parent(id) else {
            return false;
        };
        let was_connected = self.is_connected(parent);

        self.nodes[parent.0].children.retain(|child| *child != id);
        self.nodes[id.0].parent = None;

        if self.observing && was_connected {
            self.mutations.push(MutationRecord {
                added: Vec::new(),
                removed: vec![id],
            });
        }

        if self
            .fullscreen_element
            .is_some_and(|element| self.contains(id, element))
        {
            self.fullscreen_element = None;
            self.queue_event(self.root, EventKind::FullscreenChange);
        }
        if self
            .active_element
            .is_some_and(|element| self.contains(id, element))
        {
            self.active_element = None;
        }
        true
    }

    fn media_in_subtree(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node(current) else {
                continue;
            };
            if node.media.is_some() {
                out.push(current);
            }
            if node.shadow_root {
                continue;
            }
            stack.extend(node.children.iter().rev().copied());
        }
    }

    pub fn query_media(&self) -> Vec<NodeId> {
        let mut media = Vec::new();
        self.media_in_subtree(self.root, &mut media);
        media
    }

    pub fn subtree_has_media(&self, id: NodeId) -> bool {
        let mut media = Vec::new();
        self.media_in_subtree(id, &mut media);
        !media.is_empty()
    }

    pub fn set_style(&mut self, id: NodeId, property: &str, value: &str) {
        if let Some(node) = self.node_mut(id) {
            node.style.insert(property.to_string(), value.to_string());
        }
    }

    pub fn style(&self, id: NodeId, property: &str) -> Option<&str> {
        self.node(id)?.style.get(property).map(String::as_str)
    }

    pub fn position(&self, id: NodeId) -> Position {
        self.style(id, "position")
            .map(Position::parse)
            .unwrap_or(Position::Static)
    }

    pub fn add_class(&mut self, id: NodeId, class: &str) {
        if let Some(node) = self.node_mut(id) {
            node.classes.insert(class.to_string());
        }
    }

    pub fn remove_class(&mut self, id: NodeId, class: &str) {
        if let Some(node) = self.node_mut(id) {
            node.classes.remove(class);
        }
    }

    #[cfg(test)]
    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.node(id).is_some_and(|node| node.classes.contains(class))
    }

    pub fn set_text(&mut self, id: NodeId, text: &str) {
        if let Some(node) = self.node_mut(id) {
            node.text = text.to_string();
        }
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.node(id).map(|node| node.text.as_str())
    }

    pub fn set_content_editable(&mut self, id: NodeId, editable: bool) {
        if let Some(node) = self.node_mut(id) {
            node.content_editable = editable;
        }
    }

    pub fn is_content_editable(&self, id: NodeId) -> bool {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .any(|node| self.node(node).is_some_and(|node| node.content_editable))
    }

    pub fn attach_shadow(&mut self, id: NodeId) {
        if let Some(node) = self.node_mut(id) {
            node.shadow_root = true;
        }
    }

    pub fn focus(&mut self, id: NodeId) -> bool {
        if !self.is_connected(id) {
            return false;
        }
        self.active_element = Some(id);
        true
    }

    pub fn blur(&mut self) {
        self.active_element = None;
    }

    pub fn active_element(&self) -> Option<NodeId> {
        self.active_element
    }

    pub fn request_fullscreen(&mut self, id: NodeId) -> bool {
        if !self.is_connected(id) {
            return false;
        }
        if self.fullscreen_element != Some(id) {
            self.fullscreen_element = Some(id);
            self.queue_event(self.root, EventKind::FullscreenChange);
        }
        true
    }

    pub fn exit_fullscreen(&mut self) -> bool {
        if self.fullscreen_element.take().is_none() {
            return false;
        }
        self.queue_event(self.root, EventKind::FullscreenChange);
        true
    }

    pub fn fullscreen_element(&self) -> Option<NodeId> {
        self.fullscreen_element
    }

    pub fn media(&self, id: NodeId) -> Option<&MediaState> {
        self.node(id)?.media.as_ref()
    }

    pub fn playback_rate(&self, id: NodeId) -> Option<f64> {
        self.media(id).map(|media| media.playback_rate)
    }

    pub fn is_paused(&self, id: NodeId) -> Option<bool> {
        self.media(id).map(|media| media.paused)
    }

    /// Returns false for non-media nodes. Fires `RateChange` only on an actual change.
    pub fn set_playback_rate(&mut self, id: NodeId, rate: f64) -> bool {
        let Some(media) = self.node_mut(id).and_then(|node| node.media.as_mut()) else {
            return false;
        };
        if media.playback_rate != rate {
            media.playback_rate = rate;
            self.queue_event(id, EventKind::RateChange);
        }
        true
    }

    pub fn play(&mut self, id: NodeId) -> bool {
        self.set_paused(id, false)
    }

    pub fn pause(&mut self, id: NodeId) -> bool {
        self.set_paused(id, true)
    }

    fn set_paused(&mut self, id: NodeId, paused: bool) -> bool {
        let Some(media) = self.node_mut(id).and_then(|node| node.media.as_mut()) else {
            return false;
        };
        if media.paused != paused {
            media.paused = paused;
            let kind = if paused {
                EventKind::Pause
            } else {
                EventKind::Play
            };
            self.queue_event(id, kind);
        }
        true
    }

    /// Reloads the media resource. The playback rate silently falls back to
    /// normal speed, which is what remembered rates are restored against.
    pub fn load(&mut self, id: NodeId) -> bool {
        let Some(media) = self.node_mut(id).and_then(|node| node.media.as_mut()) else {
            return false;
        };
        media.playback_rate = 1.0;
        media.paused = true;
        self.queue_event(id, EventKind::LoadedMetadata);
        true
    }

    fn queue_event(&mut self, target: NodeId, kind: EventKind) {
        self.events.push_back(DomEvent { target, kind });
    }

    pub fn pop_event(&mut self) -> Option<DomEvent> {
        self.events.pop_front()
    }

    pub fn observe(&mut self) {
        self.observing = true;
    }

    pub fn disconnect_observer(&mut self) {
        self.observing = false;
        self.mutations.clear();
    }

    pub fn is_observing(&self) -> bool {
        self.observing
    }

    pub fn take_mutations(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.mutations)
    }

    pub fn new_abort_signal(&mut self) -> AbortSignal {
        self.next_signal += 1;
        AbortSignal(self.next_signal)
    }

    pub fn add_listener(&mut self, target: NodeId, kind: EventKind, signal: AbortSignal) {
        self.listeners.push(Listener {
            target,
            kind,
            signal,
        });
    }

    pub fn abort(&mut self, signal: AbortSignal) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.signal != signal);
        before - self.listeners.len()
    }

    pub fn listener_count(&self, target: NodeId, kind: EventKind) -> usize {
        self.listeners
            .iter()
            .filter(|listener| listener.target == target && listener.kind == kind)
            .count()
    }

    pub fn total_listeners(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_record_mutations_only_while_observing() {
        // given
        let mut doc = Document::new();
        let first = doc.create_video(1.0, true);
        let second = doc.create_video(1.0, true);

        // when
        doc.append_child(doc.body(), first);
        doc.observe();
        doc.append_child(doc.body(), second);

        // then
        assert_eq!(
            doc.take_mutations(),
            vec![MutationRecord {
                added: vec![second],
                removed: vec![]
            }]
        );
        assert!(doc.take_mutations().is_empty());
    }

    #[test]
    fn should_not_record_mutations_of_detached_subtrees() {
        // given
        let mut doc = Document::new();
        doc.observe();
        let wrapper = doc.create_element("div");
        let video = doc.create_video(1.0, true);

        // when
        doc.append_child(wrapper, video);

        // then
        assert!(doc.take_mutations().is_empty());
        assert!(!doc.is_connected(video));
    }

    #[test]
    fn should_find_media_in_document_order_outside_shadow_trees() {
        // given
        let mut doc = Document::new();
        let wrapper = doc.create_element("div");
        let first = doc.create_video(1.0, true);
        let second = doc.create_video(1.0, true);
        let isolated = doc.create_element("div");
        let hidden = doc.create_video(1.0, true);
        doc.append_child(doc.body(), wrapper);
        doc.append_child(wrapper, first);
        doc.append_child(doc.body(), isolated);
        doc.attach_shadow(isolated);
        doc.append_child(isolated, hidden);
        doc.append_child(doc.body(), second);

        // when
        let media = doc.query_media();

        // then
        assert_eq!(media, vec![first, second]);
        assert!(doc.subtree_has_media(wrapper));
    }

    #[test]
    fn should_move_node_when_appended_elsewhere() {
        // given
        let mut doc = Document::new();
        let a = doc.create_element("div");
        let b = doc.create_element("div");
        let child = doc.create_element("span");
        doc.append_child(doc.body(), a);
        doc.append_child(doc.body(), b);
        doc.append_child(a, child);

        // when
        doc.append_child(b, child);

        // then
        assert_eq!(doc.parent(child), Some(b));
        assert!(doc.children(a).is_empty());
        assert_eq!(doc.children(b), &[child]);
    }

    #[test]
    fn should_refuse_cycles() {
        // given
        let mut doc = Document::new();
        let outer = doc.create_element("div");
        let inner = doc.create_element("div");
        doc.append_child(outer, inner);

        // when
        let appended = doc.append_child(inner, outer);

        // then
        assert!(!appended);
        assert_eq!(doc.parent(outer), None);
    }

    #[test]
    fn should_exit_fullscreen_when_fullscreen_subtree_is_removed() {
        // given
        let mut doc = Document::new();
        let player = doc.create_element("div");
        let video = doc.create_video(1.0, true);
        doc.append_child(doc.body(), player);
        doc.append_child(player, video);
        doc.request_fullscreen(player);
        doc.pop_event();

        // when
        doc.remove(player);

        // then
        assert_eq!(doc.fullscreen_element(), None);
        assert_eq!(
            doc.pop_event(),
            Some(DomEvent {
                target: doc.root(),
                kind: EventKind::FullscreenChange
            })
        );
    }

    #[test]
    fn should_fire_rate_change_only_on_actual_change() {
        // given
        let mut doc = Document::new();
        let video = doc.create_video(1.0, true);

        // when
        doc.set_playback_rate(video, 1.0);
        doc.set_playback_rate(video, 1.5);

        // then
        assert_eq!(
            doc.pop_event(),
            Some(DomEvent {
                target: video,
                kind: EventKind::RateChange
            })
        );
        assert_eq!(doc.pop_event(), None);
    }

    #[test]
    fn should_reset_rate_silently_on_load() {
        // given
        let mut doc = Document::new();
        let video = doc.create_video(2.0, false);

        // when
        doc.load(video);

        // then
        assert_eq!(doc.playback_rate(video), Some(1.0));
        assert_eq!(doc.is_paused(video), Some(true));
        assert_eq!(
            doc.pop_event().map(|event| event.kind),
            Some(EventKind::LoadedMetadata)
        );
    }

    #[test]
    fn should_release_all_listeners_of_a_signal_at_once() {
        // given
        let mut doc = Document::new();
        let video = doc.create_video(1.0, true);
        let signal = doc.new_abort_signal();
        let other = doc.new_abort_signal();
        doc.add_listener(video, EventKind::RateChange, signal);
        doc.add_listener(video, EventKind::Play, signal);
        doc.add_listener(video, EventKind::Pause, other);

        // when
        let removed = doc.abort(signal);

        // then
        assert_eq!(removed, 2);
        assert_eq!(doc.listener_count(video, EventKind::RateChange), 0);
        assert_eq!(doc.listener_count(video, EventKind::Pause), 1);
    }

    #[test]
    fn should_inherit_content_editable() {
        // given
        let mut doc = Document::new();
        let editor = doc.create_element("div");
        let paragraph = doc.create_element("p");
        doc.append_child(doc.body(), editor);
        doc.append_child(editor, paragraph);

        // when
        doc.set_content_editable(editor, true);

        // then
        assert!(doc.is_content_editable(paragraph));
        assert!(!doc.is_content_editable(doc.body()));
    }
}
