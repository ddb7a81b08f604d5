//! Runtime players: one per playable element, alive from organ open to
//! organ close.
//!
//! Players consume performance events, mutate channel state and emit the
//! element's message templates. Recoverable trouble (device missing, bad
//! formula) is surfaced as retractable [`Problem`]s, never as errors on the
//! performance path.

/// Continuous filter player (swell/expression).
pub mod filter;
/// Organ-level engine: player registry, event routing, session thread.
pub mod organ;
/// Sound-source player (rank).
pub mod rank;

pub use filter::{ContinuousFilterPlayer, EffectHandle};
pub use organ::{OrganPlay, PlayEvent, PlayQueue};
pub use rank::RankPlayer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::disposition::{Element, ElementId, Message, MessageKind};
use crate::formula::{Context, Processor};

/// How bad a problem is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Degraded but playing (e.g. fallback to a null channel).
    Warning,
    /// The feature stays closed until the condition clears.
    Error,
}

/// A retractable fact about a player, keyed by severity and category.
///
/// Problems have set semantics: adding one twice is a no-op, and removal is
/// keyed by (severity, category) so the detail may differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub severity: Severity,
    pub category: &'static str,
    pub detail: Option<String>,
}

impl Problem {
    pub fn error(category: &'static str) -> Self {
        Self {
            severity: Severity::Error,
            category,
            detail: None,
        }
    }

    pub fn warning(category: &'static str) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Collaborator notified of raised and retracted problems, e.g. for display.
pub trait PlayObserver: Send {
    fn problem_added(&mut self, _element: ElementId, _problem: &Problem) {}

    fn problem_removed(&mut self, _element: ElementId, _problem: &Problem) {}
}

/// Observer that relies on the `tracing` output alone.
#[derive(Debug, Default)]
pub struct LogObserver;

impl PlayObserver for LogObserver {}

pub type ObserverRef = Arc<Mutex<dyn PlayObserver>>;

/// Named float parameters (PITCH, VELOCITY, VALUE, …) bound into message
/// templates at emission time.
#[derive(Debug, Default)]
pub struct PlayerContext {
    values: HashMap<String, f32>,
}

impl Context for PlayerContext {
    fn get(&self, name: &str) -> f32 {
        self.values.get(name).copied().unwrap_or(f32::NAN)
    }

    fn set(&mut self, name: &str, value: f32) {
        self.values.insert(name.to_owned(), value);
    }
}

/// A message template with its three formulas compiled.
#[derive(Debug, Clone)]
pub struct CompiledMessage {
    pub kind: MessageKind,
    status: Processor,
    data1: Processor,
    data2: Processor,
}

impl CompiledMessage {
    pub fn compile(message: &Message) -> Result<Self, crate::formula::FormulaError> {
        Ok(Self {
            kind: message.kind,
            status: Processor::compile(&message.status)?,
            data1: Processor::compile(&message.data1)?,
            data2: Processor::compile(&message.data2)?,
        })
    }

    /// Evaluate for emission. `None` when any byte is undefined.
    pub fn emit(&self, ctx: &mut dyn Context) -> Option<[u8; 3]> {
        let status = self.status.process(0.0, ctx);
        let data1 = self.data1.process(0.0, ctx);
        let data2 = self.data2.process(0.0, ctx);
        if status.is_nan() || data1.is_nan() || data2.is_nan() {
            return None;
        }
        Some([
            clamp_to(status, 255.0),
            clamp_to(data1, 127.0),
            clamp_to(data2, 127.0),
        ])
    }

    /// Match an outgoing message against this template (intercepts).
    ///
    /// Formulas run against command/data1/data2 in turn; `get` steps capture
    /// the matched bytes into `ctx`. A rejecting formula stops the match.
    pub fn matches(&self, command: u8, data1: u8, data2: u8, ctx: &mut dyn Context) -> bool {
        if self.status.process(command as f32, ctx).is_nan() {
            return false;
        }
        if self.data1.process(data1 as f32, ctx).is_nan() {
            return false;
        }
        !self.data2.process(data2 as f32, ctx).is_nan()
    }
}

fn clamp_to(value: f32, max: f32) -> u8 {
    value.round().clamp(0.0, max) as u8
}

/// State every player carries: identity, lifecycle, problems, context.
pub struct PlayerBase {
    element: ElementId,
    open: bool,
    problems: Vec<Problem>,
    observer: ObserverRef,
    pub context: PlayerContext,
}

impl PlayerBase {
    pub fn new(element: ElementId, observer: ObserverRef) -> Self {
        Self {
            element,
            open: false,
            problems: Vec::new(),
            observer,
            context: PlayerContext::default(),
        }
    }

    pub fn element(&self) -> ElementId {
        self.element
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Enter the open state, retracting every previously raised problem.
    pub fn open(&mut self) {
        let retracted: Vec<Problem> = self.problems.drain(..).collect();
        for problem in &retracted {
            self.notify_removed(problem);
        }
        self.open = true;
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn add_problem(&mut self, problem: Problem) {
        if self.problems.contains(&problem) {
            return;
        }
        match problem.severity {
            Severity::Warning => warn!(element = ?self.element, category = problem.category,
                detail = ?problem.detail, "problem raised"),
            Severity::Error => warn!(element = ?self.element, category = problem.category,
                detail = ?problem.detail, "error problem raised"),
        }
        self.observer
            .lock()
            .unwrap()
            .problem_added(self.element, &problem);
        self.problems.push(problem);
    }

    /// Retract all problems matching severity and category.
    pub fn remove_problems(&mut self, severity: Severity, category: &str) {
        let mut retracted = Vec::new();
        self.problems.retain(|problem| {
            if problem.severity == severity && problem.category == category {
                retracted.push(problem.clone());
                false
            } else {
                true
            }
        });
        for problem in &retracted {
            self.notify_removed(problem);
        }
    }

    pub fn has_problem(&self, severity: Severity, category: &str) -> bool {
        self.problems
            .iter()
            .any(|p| p.severity == severity && p.category == category)
    }

    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    fn notify_removed(&self, problem: &Problem) {
        debug!(element = ?self.element, category = problem.category, "problem retracted");
        self.observer
            .lock()
            .unwrap()
            .problem_removed(self.element, problem);
    }

    /// Compile the element's templates of `kind`; a template that fails to
    /// compile raises a warning and is skipped.
    pub fn compile_messages(&mut self, element: &Element, kind: MessageKind) -> Vec<CompiledMessage> {
        let mut compiled = Vec::new();
        for message in element.messages(kind) {
            match CompiledMessage::compile(message) {
                Ok(message) => compiled.push(message),
                Err(err) => {
                    self.add_problem(Problem::warning("message").with_detail(err.to_string()));
                }
            }
        }
        compiled
    }
}

/// The per-element runtime state machine: Closed → Open → Closed.
pub trait Player: Send {
    fn base(&self) -> &PlayerBase;

    fn base_mut(&mut self) -> &mut PlayerBase;

    /// Clear problems and perform subtype setup. May raise an Error problem
    /// (endpoint unavailable) but always leaves the player in a valid state.
    fn open(&mut self, element: &Element);

    /// Release resources and transient counters.
    fn close(&mut self);

    /// Re-derive cached attributes from the element. Idempotent: no net
    /// change emits no messages and churns no problems.
    fn element_changed(&mut self, element: &Element);

    fn play(&mut self, pitch: u8, _velocity: u8) {
        debug_assert!(false, "play event for an element that cannot sound");
        warn!(element = ?self.base().element(), pitch, "dropped play event: element cannot sound");
    }

    fn mute(&mut self, pitch: u8) {
        debug_assert!(false, "mute event for an element that cannot sound");
        warn!(element = ?self.base().element(), pitch, "dropped mute event: element cannot sound");
    }

    /// Sound-effect capability for effect-chain composition, if any.
    fn effect(&self) -> Option<EffectHandle> {
        None
    }

    /// Install the effect handles resolved from the element's references.
    fn set_effects(&mut self, _effects: Vec<EffectHandle>) {}
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::disposition::{ElementId, Message, MessageKind};

    fn base() -> PlayerBase {
        PlayerBase::new(ElementId(1), testing::log_observer())
    }

    #[test]
    fn problems_have_set_semantics() {
        let mut base = base();

        base.add_problem(Problem::warning("channels").with_detail("0-15"));
        base.add_problem(Problem::warning("channels").with_detail("0-15"));
        assert_eq!(base.problems().len(), 1);

        base.remove_problems(Severity::Warning, "channels");
        assert!(base.problems().is_empty());
    }

    #[test]
    fn removal_matches_category_regardless_of_detail() {
        let mut base = base();

        base.add_problem(Problem::warning("channels").with_detail("16"));
        base.add_problem(Problem::error("output"));
        base.remove_problems(Severity::Warning, "channels");

        assert!(!base.has_problem(Severity::Warning, "channels"));
        assert!(base.has_problem(Severity::Error, "output"));
    }

    #[test]
    fn open_retracts_previous_problems() {
        let mut base = base();
        base.add_problem(Problem::error("output"));

        base.open();
        assert!(base.problems().is_empty());
        assert!(base.is_open());
    }

    #[test]
    fn emission_binds_context_parameters() {
        let message = Message::new(MessageKind::Played, "set 144", "set PITCH", "set VELOCITY");
        let compiled = CompiledMessage::compile(&message).unwrap();

        let mut ctx = PlayerContext::default();
        ctx.set("PITCH", 60.0);
        ctx.set("VELOCITY", 100.0);

        assert_eq!(compiled.emit(&mut ctx), Some([144, 60, 100]));
    }

    #[test]
    fn emission_is_suppressed_by_an_undefined_byte() {
        let message = Message::new(MessageKind::Played, "set 144", "set PITCH", "set VELOCITY");
        let compiled = CompiledMessage::compile(&message).unwrap();

        let mut ctx = PlayerContext::default();
        ctx.set("PITCH", 60.0);
        // VELOCITY unset

        assert_eq!(compiled.emit(&mut ctx), None);
    }

    #[test]
    fn emitted_bytes_are_clamped() {
        let message = Message::new(MessageKind::Played, "set 300", "set 200", "sub 5");
        let compiled = CompiledMessage::compile(&message).unwrap();

        let mut ctx = PlayerContext::default();
        assert_eq!(compiled.emit(&mut ctx), Some([255, 127, 0]));
    }

    #[test]
    fn intercept_matching_captures_bytes() {
        // Control change (0xB0) on controller 7; capture the value.
        let message = Message::new(MessageKind::Intercept, "176", "7", "0-127 | get VALUE");
        let compiled = CompiledMessage::compile(&message).unwrap();

        let mut ctx = PlayerContext::default();
        assert!(compiled.matches(0xB0, 7, 99, &mut ctx));
        assert_eq!(ctx.get("VALUE"), 99.0);

        assert!(!compiled.matches(0x90, 7, 99, &mut ctx));
        assert!(!compiled.matches(0xB0, 8, 99, &mut ctx));
    }

    #[test]
    fn bad_template_raises_a_warning_and_is_skipped() {
        let mut base = base();
        let mut element = crate::disposition::Element::rank(
            ElementId(1),
            crate::disposition::Rank::new(Some("out"), "0-15"),
        );
        element
            .messages
            .push(Message::new(MessageKind::Played, "bogus 1", "set 0", "set 0"));
        element
            .messages
            .push(Message::new(MessageKind::Played, "set 144", "set 1", "set 2"));

        let compiled = base.compile_messages(&element, MessageKind::Played);
        assert_eq!(compiled.len(), 1);
        assert!(base.has_problem(Severity::Warning, "message"));
    }
}
