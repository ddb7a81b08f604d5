//! The organ description the engine plays from.
//!
//! Elements are authored by an external editing model; the engine reads them
//! and reacts to change notifications (see `play::OrganPlay`). The only
//! attributes mutated at performance time are the derived ones other
//! elements toggle: a rank's `engaged` flag and a filter's continuous value.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ElementId(pub u64);

/// Event kind of a message template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MessageKind {
    Engaged,
    Disengaged,
    Played,
    Muted,
    Engaging,
    Intercept,
}

/// A message template: an event kind plus one formula per wire byte.
///
/// Immutable once authored; evaluated against a player context at emission
/// (or, for intercepts, match) time.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Message {
    pub kind: MessageKind,
    pub status: String,
    pub data1: String,
    pub data2: String,
}

impl Message {
    pub fn new(kind: MessageKind, status: &str, data1: &str, data2: &str) -> Self {
        Self {
            kind,
            status: status.to_owned(),
            data1: data1.to_owned(),
            data2: data2.to_owned(),
        }
    }
}

/// A sound source: notes played into it come out of a leased channel on its
/// output endpoint.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rank {
    /// Output endpoint name; `None` while unconfigured.
    pub output: Option<String>,
    /// Acceptance pattern gating which channel numbers may be leased.
    pub channels: String,
    /// Delay in milliseconds applied to every outgoing message.
    pub delay: u64,
    /// Derived sounding state, toggled by referencing elements.
    pub engaged: bool,
}

impl Rank {
    pub fn new(output: Option<&str>, channels: &str) -> Self {
        Self {
            output: output.map(str::to_owned),
            channels: channels.to_owned(),
            delay: 0,
            engaged: false,
        }
    }
}

/// An element exposing a continuous value (swell, expression pedal) and
/// intercepting outgoing messages of the ranks routed through it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContinuousFilter {
    /// Current position, 0.0–1.0.
    pub value: f32,
}

impl ContinuousFilter {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ElementKind {
    Rank(Rank),
    ContinuousFilter(ContinuousFilter),
}

/// Identity node in the organ graph.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Element {
    id: ElementId,
    pub kind: ElementKind,
    /// Ordered message templates.
    pub messages: Vec<Message>,
    /// Ordered references to other elements; a rank's references declare its
    /// effect chain.
    pub references: Vec<ElementId>,
}

impl Element {
    pub fn rank(id: ElementId, rank: Rank) -> Self {
        Self {
            id,
            kind: ElementKind::Rank(rank),
            messages: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn continuous_filter(id: ElementId, filter: ContinuousFilter) -> Self {
        Self {
            id,
            kind: ElementKind::ContinuousFilter(filter),
            messages: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn messages(&self, kind: MessageKind) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(move |m| m.kind == kind)
    }
}

/// The whole organ description, keyed by element identity.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Organ {
    elements: BTreeMap<ElementId, Element>,
}

impl Organ {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, element: Element) {
        self.elements.insert(element.id(), element);
    }

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn element_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        self.elements.get_mut(&id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    /// Toggle a rank's derived engaged flag.
    ///
    /// `Some(changed)` when the element is a rank; `None` when it is missing
    /// or of another kind, so callers can tell a misrouted toggle from a
    /// no-op one.
    pub fn set_engaged(&mut self, id: ElementId, engaged: bool) -> Option<bool> {
        match self.elements.get_mut(&id) {
            Some(Element {
                kind: ElementKind::Rank(rank),
                ..
            }) => {
                let changed = rank.engaged != engaged;
                rank.engaged = engaged;
                Some(changed)
            }
            _ => None,
        }
    }

    /// Move a filter's continuous value.
    ///
    /// `Some(changed)` when the element is a filter; `None` when it is
    /// missing or of another kind.
    pub fn set_value(&mut self, id: ElementId, value: f32) -> Option<bool> {
        match self.elements.get_mut(&id) {
            Some(Element {
                kind: ElementKind::ContinuousFilter(filter),
                ..
            }) => {
                let changed = filter.value != value;
                filter.value = value;
                Some(changed)
            }
            _ => None,
        }
    }
}
