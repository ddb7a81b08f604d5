//! Player of a sound-source element (rank).

use std::sync::Arc;

use tracing::debug;

use crate::channel::delay::DelayedChannel;
use crate::channel::pool::{ChannelRegistry, PoolHandle};
use crate::channel::{Channel, NullChannel};
use crate::disposition::{Element, ElementId, ElementKind, Message, MessageKind, Rank};
use crate::formula::{Context, EmptyContext, Processor};
use crate::play::{
    CompiledMessage, EffectHandle, ObserverRef, Player, PlayerBase, PlayerContext, Problem,
    Severity,
};

/// Disengaged ↔ Engaged state machine over the base player, plus per-pitch
/// polyphony. Engagement is tracked by channel presence: engaged iff a
/// channel (possibly the null fallback) is held.
pub struct RankPlayer {
    base: PlayerBase,
    registry: Arc<ChannelRegistry>,
    pool: Option<PoolHandle>,
    channel: Option<Box<dyn Channel>>,

    // Cached element attributes, re-derived on change notifications.
    output: Option<String>,
    pattern: Option<Processor>,
    pattern_src: String,
    delay: u64,
    cached_messages: Vec<Message>,

    effects: Vec<EffectHandle>,

    engaged_messages: Vec<CompiledMessage>,
    disengaged_messages: Vec<CompiledMessage>,
    played_messages: Vec<CompiledMessage>,
    muted_messages: Vec<CompiledMessage>,

    /// Overlapping note-ons per pitch; Played/Muted fire on the 0→1 and 1→0
    /// transitions only.
    played: [u32; 128],
    total_notes: u32,
}

impl RankPlayer {
    pub fn new(element: ElementId, registry: Arc<ChannelRegistry>, observer: ObserverRef) -> Self {
        Self {
            base: PlayerBase::new(element, observer),
            registry,
            pool: None,
            channel: None,
            output: None,
            pattern: None,
            pattern_src: String::new(),
            delay: 0,
            cached_messages: Vec::new(),
            effects: Vec::new(),
            engaged_messages: Vec::new(),
            disengaged_messages: Vec::new(),
            played_messages: Vec::new(),
            muted_messages: Vec::new(),
            played: [0; 128],
            total_notes: 0,
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.channel.is_some()
    }

    pub fn notes_sounding(&self) -> u32 {
        self.total_notes
    }

    fn compile_pattern(&mut self, rank: &Rank) {
        self.pattern_src = rank.channels.clone();
        match Processor::compile(&rank.channels) {
            Ok(processor) => self.pattern = Some(processor),
            Err(err) => {
                // Malformed acceptance pattern: accept nothing, keep playing.
                self.pattern = None;
                self.base.add_problem(
                    Problem::warning("channels")
                        .with_detail(format!("{}: {err}", rank.channels)),
                );
            }
        }
    }

    fn compile_templates(&mut self, element: &Element) {
        self.cached_messages = element.messages.clone();
        self.engaged_messages = self.base.compile_messages(element, MessageKind::Engaged);
        self.disengaged_messages = self.base.compile_messages(element, MessageKind::Disengaged);
        self.played_messages = self.base.compile_messages(element, MessageKind::Played);
        self.muted_messages = self.base.compile_messages(element, MessageKind::Muted);
    }

    /// Resolve the output endpoint. Failures raise an Error problem and are
    /// retried only on the next open (or when the name changes).
    fn resolve_output(&mut self) {
        match self.output.clone() {
            Some(name) => match self.registry.open(&name) {
                Ok(handle) => self.pool = Some(handle),
                Err(err) => {
                    self.base.add_problem(
                        Problem::error("output").with_detail(format!("{name}: {err}")),
                    );
                }
            },
            None => {
                self.base.add_problem(Problem::warning("output"));
            }
        }
    }

    fn engage(&mut self) {
        let pattern = self.pattern.clone();
        let accept = move |number: u8| match &pattern {
            Some(pattern) => !pattern.process(number as f32, &mut EmptyContext).is_nan(),
            None => false,
        };

        let channel: Box<dyn Channel> = match self
            .pool
            .as_ref()
            .and_then(|pool| pool.acquire(&accept))
        {
            Some(pooled) => {
                debug!(element = ?self.base.element(), channel = pooled.number(), "engaged");
                let mut channel: Box<dyn Channel> = Box::new(pooled);
                for effect in &self.effects {
                    channel = effect.effect_sound(channel);
                }
                if self.delay > 0 {
                    channel = Box::new(DelayedChannel::new(channel, self.delay));
                }
                channel
            }
            None => {
                self.base.add_problem(
                    Problem::warning("channels").with_detail(self.pattern_src.clone()),
                );
                Box::new(NullChannel)
            }
        };
        self.channel = Some(channel);

        if let Some(channel) = self.channel.as_mut() {
            emit_messages(&self.engaged_messages, &mut self.base.context, channel);
        }
    }

    fn disengage(&mut self) {
        self.base.remove_problems(Severity::Warning, "channels");

        // Templates first: they may still need the live channel.
        if let Some(channel) = self.channel.as_mut() {
            emit_messages(&self.disengaged_messages, &mut self.base.context, channel);
            channel.release();
        }
        self.channel = None;
        debug!(element = ?self.base.element(), "disengaged");
    }
}

impl Player for RankPlayer {
    fn base(&self) -> &PlayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PlayerBase {
        &mut self.base
    }

    fn open(&mut self, element: &Element) {
        let rank = match &element.kind {
            ElementKind::Rank(rank) => rank.clone(),
            _ => {
                debug_assert!(false, "rank player opened on a non-rank element");
                return;
            }
        };

        self.base.open();
        self.output = rank.output.clone();
        self.delay = rank.delay;
        self.compile_pattern(&rank);
        self.compile_templates(element);
        self.resolve_output();
    }

    fn close(&mut self) {
        if self.channel.is_some() {
            self.disengage();
        }
        self.played = [0; 128];
        self.total_notes = 0;
        self.pool = None;
        self.base.close();
    }

    fn element_changed(&mut self, element: &Element) {
        let rank = match &element.kind {
            ElementKind::Rank(rank) => rank.clone(),
            _ => return,
        };

        if self.cached_messages != element.messages {
            self.base.remove_problems(Severity::Warning, "message");
            self.compile_templates(element);
        }

        if rank.channels != self.pattern_src {
            self.base.remove_problems(Severity::Warning, "channels");
            self.compile_pattern(&rank);
        }

        self.delay = rank.delay;

        if rank.output != self.output {
            if self.channel.is_some() {
                self.disengage();
            }
            self.pool = None;
            self.base.remove_problems(Severity::Error, "output");
            self.base.remove_problems(Severity::Warning, "output");
            self.output = rank.output.clone();
            self.resolve_output();
        }

        // Track the derived engaged flag, independent of play/mute traffic.
        if self.pool.is_some() {
            if self.channel.is_none() && rank.engaged {
                self.engage();
            } else if self.channel.is_some() && !rank.engaged {
                self.disengage();
            }
        }
    }

    fn play(&mut self, pitch: u8, velocity: u8) {
        let Some(slot) = self.played.get_mut(pitch as usize) else {
            debug_assert!(false, "pitch out of range");
            return;
        };
        let first_press = *slot == 0;
        *slot += 1;
        self.total_notes += 1;

        // Auto-engage on the first note, same path as an explicit engage.
        if self.channel.is_none() {
            self.engage();
        }

        if first_press {
            self.base.context.set("PITCH", pitch as f32);
            self.base.context.set("VELOCITY", velocity as f32);
            if let Some(channel) = self.channel.as_mut() {
                emit_messages(&self.played_messages, &mut self.base.context, channel);
            }
        }
    }

    fn mute(&mut self, pitch: u8) {
        let Some(slot) = self.played.get_mut(pitch as usize) else {
            debug_assert!(false, "pitch out of range");
            return;
        };
        if *slot == 0 {
            // Spurious note-off; counters never go negative.
            return;
        }
        *slot -= 1;
        self.total_notes -= 1;

        if *slot == 0 {
            self.base.context.set("PITCH", pitch as f32);
            if let Some(channel) = self.channel.as_mut() {
                emit_messages(&self.muted_messages, &mut self.base.context, channel);
            }
        }
    }

    fn set_effects(&mut self, effects: Vec<EffectHandle>) {
        self.effects = effects;
    }
}

fn emit_messages(
    messages: &[CompiledMessage],
    ctx: &mut PlayerContext,
    channel: &mut Box<dyn Channel>,
) {
    for message in messages {
        if let Some([status, data1, data2]) = message.emit(ctx) {
            channel.send(status, data1, data2);
        }
    }
}
