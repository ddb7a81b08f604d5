//! The organ-level engine: one player per playable element, plus event
//! routing and the per-organ session thread.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::channel::pool::ChannelRegistry;
use crate::disposition::{Element, ElementId, ElementKind, Organ};
use crate::play::filter::ContinuousFilterPlayer;
use crate::play::rank::RankPlayer;
use crate::play::{EffectHandle, LogObserver, ObserverRef, Player, Problem};

/// A performance event addressed to one element.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayEvent {
    NoteOn {
        element: ElementId,
        pitch: u8,
        velocity: u8,
    },
    NoteOff {
        element: ElementId,
        pitch: u8,
    },
    /// A switch toggling a rank's derived engaged flag.
    Engaged {
        element: ElementId,
        engaged: bool,
    },
    /// A continuous controller moving a filter's value.
    Value {
        element: ElementId,
        value: f32,
    },
    ElementChanged {
        element: ElementId,
    },
    Shutdown,
}

/// Cloneable sending side of an organ's event queue.
///
/// Input sources on any thread funnel their events through here; the engine
/// applies them one at a time, which is what gives each player its
/// at-most-one-writer guarantee.
#[derive(Clone)]
pub struct PlayQueue {
    tx: Sender<PlayEvent>,
}

impl PlayQueue {
    /// `false` when the engine side is gone.
    pub fn send(&self, event: PlayEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PlayEvent::Shutdown);
    }
}

/// Drives the players of one organ.
pub struct OrganPlay {
    organ: Arc<Mutex<Organ>>,
    registry: Arc<ChannelRegistry>,
    observer: ObserverRef,
    players: HashMap<ElementId, Box<dyn Player>>,
    open: bool,
}

impl OrganPlay {
    pub fn new(organ: Arc<Mutex<Organ>>, registry: Arc<ChannelRegistry>) -> Self {
        Self::with_observer(organ, registry, Arc::new(Mutex::new(LogObserver)))
    }

    pub fn with_observer(
        organ: Arc<Mutex<Organ>>,
        registry: Arc<ChannelRegistry>,
        observer: ObserverRef,
    ) -> Self {
        Self {
            organ,
            registry,
            observer,
            players: HashMap::new(),
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Open the organ for performance: create and open a player per element,
    /// wire effect chains, then establish initial engagement state.
    pub fn open(&mut self) {
        if self.open {
            return;
        }
        self.open = true;
        debug!("opening organ for performance");

        let organ = self.organ.lock().unwrap().clone();
        for element in organ.elements() {
            let player: Box<dyn Player> = match &element.kind {
                ElementKind::Rank(_) => Box::new(RankPlayer::new(
                    element.id(),
                    self.registry.clone(),
                    self.observer.clone(),
                )),
                ElementKind::ContinuousFilter(_) => Box::new(ContinuousFilterPlayer::new(
                    element.id(),
                    self.observer.clone(),
                )),
            };
            self.players.insert(element.id(), player);
        }

        for element in organ.elements() {
            if let Some(player) = self.players.get_mut(&element.id()) {
                player.open(element);
            }
        }

        for element in organ.elements() {
            self.refresh_effects(element);
            if let Some(player) = self.players.get_mut(&element.id()) {
                player.element_changed(element);
            }
        }
    }

    /// Stop performance: close and destroy every player. Transient state
    /// (counters, leases, problems) does not survive.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        for player in self.players.values_mut() {
            player.close();
        }
        self.players.clear();
        self.open = false;
        debug!("organ closed");
    }

    pub fn play_note(&mut self, element: ElementId, pitch: u8, velocity: u8) {
        match self.players.get_mut(&element) {
            Some(player) => player.play(pitch, velocity),
            None => unroutable(element, "note on"),
        }
    }

    pub fn mute_note(&mut self, element: ElementId, pitch: u8) {
        match self.players.get_mut(&element) {
            Some(player) => player.mute(pitch),
            None => unroutable(element, "note off"),
        }
    }

    /// Toggle a rank's derived engaged flag and let its player react.
    pub fn set_engaged(&mut self, element: ElementId, engaged: bool) {
        let changed = self.organ.lock().unwrap().set_engaged(element, engaged);
        match changed {
            Some(true) => self.element_changed(element),
            Some(false) => {}
            // Missing element or a toggle aimed at a non-rank.
            None => unroutable(element, "engage"),
        }
    }

    /// Move a filter's continuous value and let its player rebroadcast.
    pub fn set_value(&mut self, element: ElementId, value: f32) {
        let changed = self.organ.lock().unwrap().set_value(element, value);
        match changed {
            Some(true) => self.element_changed(element),
            Some(false) => {}
            // Missing element or a value aimed at a non-filter.
            None => unroutable(element, "value"),
        }
    }

    /// Notification that an element's attributes were edited.
    pub fn element_changed(&mut self, element: ElementId) {
        let snapshot = self.organ.lock().unwrap().element(element).cloned();
        match snapshot {
            Some(snapshot) => {
                self.refresh_effects(&snapshot);
                match self.players.get_mut(&element) {
                    Some(player) => player.element_changed(&snapshot),
                    None => {
                        if self.open {
                            unroutable(element, "element change");
                        }
                    }
                }
            }
            None => unroutable(element, "element change"),
        }
    }

    /// Current problems of one element's player.
    pub fn problems(&self, element: ElementId) -> Vec<Problem> {
        self.players
            .get(&element)
            .map(|player| player.base().problems().to_vec())
            .unwrap_or_default()
    }

    pub fn handle(&mut self, event: PlayEvent) {
        match event {
            PlayEvent::NoteOn {
                element,
                pitch,
                velocity,
            } => self.play_note(element, pitch, velocity),
            PlayEvent::NoteOff { element, pitch } => self.mute_note(element, pitch),
            PlayEvent::Engaged { element, engaged } => self.set_engaged(element, engaged),
            PlayEvent::Value { element, value } => self.set_value(element, value),
            PlayEvent::ElementChanged { element } => self.element_changed(element),
            PlayEvent::Shutdown => {}
        }
    }

    /// Move the engine onto its own consumer thread.
    ///
    /// Events from any number of producers are applied strictly one at a
    /// time. `Shutdown` stops the loop and the engine is handed back through
    /// the join handle.
    pub fn spawn(mut self) -> (PlayQueue, JoinHandle<OrganPlay>) {
        let (tx, rx) = mpsc::channel();

        let worker = thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                if event == PlayEvent::Shutdown {
                    break;
                }
                self.handle(event);
            }
            self
        });

        (PlayQueue { tx }, worker)
    }

    /// Resolve a rank's effect handles from its reference order.
    fn refresh_effects(&mut self, element: &Element) {
        if !matches!(element.kind, ElementKind::Rank(_)) {
            return;
        }
        let effects: Vec<EffectHandle> = element
            .references
            .iter()
            .filter_map(|id| self.players.get(id).and_then(|player| player.effect()))
            .collect();
        if let Some(player) = self.players.get_mut(&element.id()) {
            player.set_effects(effects);
        }
    }
}

fn unroutable(element: ElementId, what: &str) {
    debug_assert!(false, "unroutable {what} event for {element:?}");
    warn!(?element, what, "dropped event for unknown element");
}
