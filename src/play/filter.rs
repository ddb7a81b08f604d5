//! Player of a continuous filter element (swell, expression pedal).
//!
//! Every channel routed through the filter gets its own decorator with
//! independent filtering state. The filter's Engaging templates rebroadcast
//! the current continuous value into each decorated channel whenever the
//! value moves or a channel is newly routed.

use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::disposition::{Element, ElementId, ElementKind, Message, MessageKind};
use crate::formula::Context;
use crate::play::{CompiledMessage, ObserverRef, Player, PlayerBase, PlayerContext, Severity};

pub struct ContinuousFilterPlayer {
    base: PlayerBase,
    core: Arc<Mutex<FilterCore>>,
    cached_messages: Vec<Message>,
}

/// Shared between the player and its per-channel decorators.
struct FilterCore {
    value: f32,
    context: PlayerContext,
    intercepts: Vec<CompiledMessage>,
    engaging: Vec<CompiledMessage>,
    links: Vec<Arc<Mutex<FilterLink>>>,
}

/// One decorated downstream channel.
struct FilterLink {
    inner: Box<dyn Channel>,
}

impl FilterCore {
    /// Evaluate the Engaging templates at the current value.
    ///
    /// The core lock is never held while a link is locked: chains may route
    /// the same filters in different orders, so rendered bytes travel between
    /// the two locks instead.
    fn render_engaging(&mut self) -> Vec<[u8; 3]> {
        self.context.set("VALUE", self.value);
        let engaging = self.engaging.clone();
        let mut rendered = Vec::new();
        for message in &engaging {
            if let Some(bytes) = message.emit(&mut self.context) {
                rendered.push(bytes);
            }
        }
        rendered
    }
}

fn send_into(link: &Arc<Mutex<FilterLink>>, rendered: &[[u8; 3]]) {
    let mut link = link.lock().unwrap();
    for [status, data1, data2] in rendered {
        link.inner.send(*status, *data1, *data2);
    }
}

impl ContinuousFilterPlayer {
    pub fn new(element: ElementId, observer: ObserverRef) -> Self {
        Self {
            base: PlayerBase::new(element, observer),
            core: Arc::new(Mutex::new(FilterCore {
                value: 0.0,
                context: PlayerContext::default(),
                intercepts: Vec::new(),
                engaging: Vec::new(),
                links: Vec::new(),
            })),
            cached_messages: Vec::new(),
        }
    }

    pub fn value(&self) -> f32 {
        self.core.lock().unwrap().value
    }

    /// Active per-channel decorators.
    pub fn channels(&self) -> usize {
        self.core.lock().unwrap().links.len()
    }

    fn compile_templates(&mut self, element: &Element) {
        self.cached_messages = element.messages.clone();
        let intercepts = self.base.compile_messages(element, MessageKind::Intercept);
        let engaging = self.base.compile_messages(element, MessageKind::Engaging);

        let mut core = self.core.lock().unwrap();
        core.intercepts = intercepts;
        core.engaging = engaging;
    }
}

impl Player for ContinuousFilterPlayer {
    fn base(&self) -> &PlayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PlayerBase {
        &mut self.base
    }

    fn open(&mut self, element: &Element) {
        let filter = match &element.kind {
            ElementKind::ContinuousFilter(filter) => filter.clone(),
            _ => {
                debug_assert!(false, "filter player opened on a non-filter element");
                return;
            }
        };

        self.base.open();
        self.compile_templates(element);

        let mut core = self.core.lock().unwrap();
        core.value = filter.value;
        core.links.clear();
    }

    fn close(&mut self) {
        self.core.lock().unwrap().links.clear();
        self.base.close();
    }

    fn element_changed(&mut self, element: &Element) {
        let filter = match &element.kind {
            ElementKind::ContinuousFilter(filter) => filter.clone(),
            _ => return,
        };

        if !self.base.is_open() {
            return;
        }

        if self.cached_messages != element.messages {
            self.base.remove_problems(Severity::Warning, "message");
            self.compile_templates(element);
        }

        let (links, rendered) = {
            let mut core = self.core.lock().unwrap();
            if core.value == filter.value {
                return;
            }
            core.value = filter.value;
            (core.links.clone(), core.render_engaging())
        };
        for link in &links {
            send_into(link, &rendered);
        }
    }

    fn effect(&self) -> Option<EffectHandle> {
        Some(EffectHandle {
            core: self.core.clone(),
        })
    }
}

/// Sound-effect capability handed to sound-source players for effect-chain
/// composition. Cloneable and detached from the player's borrow.
#[derive(Clone)]
pub struct EffectHandle {
    core: Arc<Mutex<FilterCore>>,
}

impl EffectHandle {
    /// Wrap `channel` in a fresh per-channel decorator.
    ///
    /// The decorator immediately hears the current value, so a newly routed
    /// rank starts out at the right position.
    pub fn effect_sound(&self, channel: Box<dyn Channel>) -> Box<dyn Channel> {
        let link = Arc::new(Mutex::new(FilterLink { inner: channel }));

        let rendered = {
            let mut core = self.core.lock().unwrap();
            core.links.push(link.clone());
            core.render_engaging()
        };
        send_into(&link, &rendered);

        Box::new(FilteredChannel {
            core: self.core.clone(),
            link,
        })
    }
}

struct FilteredChannel {
    core: Arc<Mutex<FilterCore>>,
    link: Arc<Mutex<FilterLink>>,
}

impl Channel for FilteredChannel {
    fn send(&mut self, status: u8, data1: u8, data2: u8) {
        // Intercepts match the command, not the per-channel status: the
        // channel nibble is deliberately ignored.
        let command = status & 0xF0;

        let rendered = {
            let mut core = self.core.lock().unwrap();
            let mut filtered = false;
            {
                let FilterCore {
                    context,
                    intercepts,
                    ..
                } = &mut *core;
                for intercept in intercepts.iter() {
                    if intercept.matches(command, data1, data2, context) {
                        filtered = true;
                    }
                }
            }
            filtered.then(|| core.render_engaging())
        };

        match rendered {
            Some(rendered) => send_into(&self.link, &rendered),
            None => self.link.lock().unwrap().inner.send(status, data1, data2),
        }
    }

    fn release(&mut self) {
        {
            let mut core = self.core.lock().unwrap();
            core.links.retain(|link| !Arc::ptr_eq(link, &self.link));
        }
        self.link.lock().unwrap().inner.release();
    }
}
