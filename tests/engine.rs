//! End-to-end engine tests against captured endpoints.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pipework::channel::pool::ChannelRegistry;
use pipework::disposition::{
    ContinuousFilter, Element, ElementId, Message, MessageKind, Organ, Rank,
};
use pipework::io::{Capture, StaticProvider};
use pipework::play::{OrganPlay, PlayEvent, Severity};

const GREAT: ElementId = ElementId(1);
const SWELL_RANK: ElementId = ElementId(2);
const SWELL: ElementId = ElementId(10);

fn registry_with(capture: &Capture, name: &str) -> Arc<ChannelRegistry> {
    let provider = StaticProvider::new();
    let endpoint_capture = capture.clone();
    provider.register(name, move || Ok(endpoint_capture.endpoint()));
    ChannelRegistry::new(Box::new(provider))
}

fn rank(id: ElementId, channels: &str) -> Element {
    let mut element = Element::rank(id, Rank::new(Some("out"), channels));
    element.messages.push(Message::new(
        MessageKind::Engaged,
        "set 192",
        "set 20",
        "set 0",
    ));
    element.messages.push(Message::new(
        MessageKind::Disengaged,
        "set 176",
        "set 123",
        "set 0",
    ));
    element.messages.push(Message::new(
        MessageKind::Played,
        "set 144",
        "set PITCH",
        "set VELOCITY",
    ));
    element
        .messages
        .push(Message::new(MessageKind::Muted, "set 128", "set PITCH", "set 0"));
    element
}

fn swell(id: ElementId, value: f32) -> Element {
    let mut element = Element::continuous_filter(id, ContinuousFilter::new(value));
    element
        .messages
        .push(Message::new(MessageKind::Intercept, "176", "7", "0-127"));
    element.messages.push(Message::new(
        MessageKind::Engaging,
        "set 176",
        "set 11",
        "set VALUE | mult 127",
    ));
    element
}

#[test]
fn notes_are_transition_exact_across_couplers() {
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");
    let mut organ = Organ::new();
    organ.add(rank(GREAT, "0-15"));

    let mut play = OrganPlay::new(Arc::new(Mutex::new(organ)), registry);
    play.open();
    play.set_engaged(GREAT, true);
    capture.clear();

    // Two couplers holding the same pitch: one note-on, one note-off.
    play.play_note(GREAT, 60, 100);
    play.play_note(GREAT, 60, 90);
    play.mute_note(GREAT, 60);
    play.mute_note(GREAT, 60);
    play.mute_note(GREAT, 60); // spurious

    assert_eq!(capture.messages(), vec![[0x90, 60, 100], [0x80, 60, 0]]);
    play.close();
}

#[test]
fn rejecting_acceptance_pattern_degrades_to_silence() {
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");
    let mut organ = Organ::new();
    organ.add(rank(GREAT, "16"));

    let mut play = OrganPlay::new(Arc::new(Mutex::new(organ)), registry);
    play.open();
    play.set_engaged(GREAT, true);

    // Engaged, but everything lands in the null fallback.
    assert!(capture.messages().is_empty());
    assert!(play
        .problems(GREAT)
        .iter()
        .any(|p| p.severity == Severity::Warning && p.category == "channels"));

    play.play_note(GREAT, 60, 100);
    assert!(capture.messages().is_empty());
    play.close();
}

#[test]
fn shared_endpoint_is_opened_once_and_closed_with_the_last_user() {
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");
    let mut organ = Organ::new();
    organ.add(rank(GREAT, "0-15"));
    organ.add(rank(SWELL_RANK, "0-15"));

    let mut play = OrganPlay::new(Arc::new(Mutex::new(organ)), registry.clone());
    play.open();
    play.set_engaged(GREAT, true);
    play.set_engaged(SWELL_RANK, true);
    assert_eq!(capture.opens(), 1);

    play.close();

    // All pool handles are gone, so a new session opens the device afresh.
    let handle = registry.open("out").unwrap();
    assert_eq!(capture.opens(), 2);
    assert_eq!(handle.leased(), 0);
}

#[test]
fn concurrent_ranks_lease_distinct_channels() {
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");
    let mut organ = Organ::new();
    organ.add(rank(GREAT, "0-15"));
    organ.add(rank(SWELL_RANK, "0-15"));

    let mut play = OrganPlay::new(Arc::new(Mutex::new(organ)), registry);
    play.open();
    play.set_engaged(GREAT, true);
    play.set_engaged(SWELL_RANK, true);
    capture.clear();

    play.play_note(GREAT, 60, 100);
    play.play_note(SWELL_RANK, 60, 100);

    let statuses: Vec<u8> = capture.messages().iter().map(|m| m[0]).collect();
    assert_eq!(statuses.len(), 2);
    assert_ne!(statuses[0] & 0x0F, statuses[1] & 0x0F);
    play.close();
}

#[test]
fn delayed_rank_holds_messages_back_in_order() {
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");
    let mut element = rank(GREAT, "0-15");
    if let pipework::disposition::ElementKind::Rank(rank) = &mut element.kind {
        rank.delay = 25;
    }
    let mut organ = Organ::new();
    organ.add(element);

    let mut play = OrganPlay::new(Arc::new(Mutex::new(organ)), registry);
    play.open();
    play.set_engaged(GREAT, true);
    play.play_note(GREAT, 60, 100);

    // Nothing on the wire yet.
    thread::sleep(Duration::from_millis(5));
    assert!(capture.messages().is_empty());

    thread::sleep(Duration::from_millis(100));
    assert_eq!(capture.messages(), vec![[0xC0, 20, 0], [0x90, 60, 100]]);

    let timed = capture.timed_messages();
    assert!(timed[1].0 >= timed[0].0);
    play.close();
}

#[test]
fn swell_decorates_every_routed_rank() {
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");
    let mut organ = Organ::new();
    let mut great = rank(GREAT, "0-15");
    great.references.push(SWELL);
    let mut swell_rank = rank(SWELL_RANK, "0-15");
    swell_rank.references.push(SWELL);
    organ.add(great);
    organ.add(swell_rank);
    organ.add(swell(SWELL, 0.0));

    let mut play = OrganPlay::new(Arc::new(Mutex::new(organ)), registry);
    play.open();
    play.set_engaged(GREAT, true);
    play.set_engaged(SWELL_RANK, true);
    capture.clear();

    play.set_value(SWELL, 1.0);

    // One rebroadcast per decorated channel, at full value, each on its own
    // leased channel number.
    assert_eq!(capture.messages(), vec![[0xB0, 11, 127], [0xB1, 11, 127]]);

    // No net change: nothing more goes out.
    play.set_value(SWELL, 1.0);
    assert_eq!(capture.messages().len(), 2);
    play.close();
}

#[test]
fn cross_routed_swells_do_not_stall() {
    // Two filters routed in opposite orders by two ranks, with one rank's
    // traffic arriving from a delay worker while the session thread sweeps
    // both values. Progress here means no lock-ordering cycle between the
    // filter cores.
    const CRESCENDO: ElementId = ElementId(11);
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");

    let mut great = rank(GREAT, "0-15");
    great.references.push(SWELL);
    great.references.push(CRESCENDO);
    if let pipework::disposition::ElementKind::Rank(rank) = &mut great.kind {
        rank.delay = 2;
    }
    let mut swell_rank = rank(SWELL_RANK, "0-15");
    swell_rank.references.push(CRESCENDO);
    swell_rank.references.push(SWELL);

    let mut crescendo = swell(CRESCENDO, 0.0);
    for message in &mut crescendo.messages {
        if message.kind == MessageKind::Engaging {
            message.data1 = "set 1".to_owned();
        }
    }

    let mut organ = Organ::new();
    organ.add(great);
    organ.add(swell_rank);
    organ.add(swell(SWELL, 0.0));
    organ.add(crescendo);

    let mut play = OrganPlay::new(Arc::new(Mutex::new(organ)), registry);
    play.open();
    play.set_engaged(GREAT, true);
    play.set_engaged(SWELL_RANK, true);

    for i in 0..100u32 {
        play.play_note(GREAT, 60, 100);
        play.play_note(SWELL_RANK, 61, 100);
        play.set_value(SWELL, (i % 10) as f32 / 10.0);
        play.set_value(CRESCENDO, ((i + 5) % 10) as f32 / 10.0);
        play.mute_note(GREAT, 60);
        play.mute_note(SWELL_RANK, 61);
    }

    thread::sleep(Duration::from_millis(100));
    assert!(!capture.messages().is_empty());
    play.close();
}

#[test]
fn disengaging_rank_leaves_the_swell_quiet() {
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");
    let mut organ = Organ::new();
    let mut great = rank(GREAT, "0-15");
    great.references.push(SWELL);
    organ.add(great);
    organ.add(swell(SWELL, 0.0));

    let mut play = OrganPlay::new(Arc::new(Mutex::new(organ)), registry);
    play.open();
    play.set_engaged(GREAT, true);
    play.set_engaged(GREAT, false);
    capture.clear();

    // The released channel no longer hears the swell.
    play.set_value(SWELL, 1.0);
    assert!(capture.messages().is_empty());
    play.close();
}

#[test]
fn session_thread_serializes_concurrent_producers() {
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");
    let mut organ = Organ::new();
    organ.add(rank(GREAT, "0-15"));

    let mut play = OrganPlay::new(Arc::new(Mutex::new(organ)), registry);
    play.open();
    play.set_engaged(GREAT, true);
    capture.clear();

    let (queue, worker) = play.spawn();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let queue = queue.clone();
            thread::spawn(move || {
                let pitch = 60 + i;
                for _ in 0..50 {
                    queue.send(PlayEvent::NoteOn {
                        element: GREAT,
                        pitch,
                        velocity: 100,
                    });
                    queue.send(PlayEvent::NoteOff {
                        element: GREAT,
                        pitch,
                    });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    queue.shutdown();
    let mut play = worker.join().unwrap();

    // Per pitch, ons and offs alternate and balance out.
    let messages = capture.messages();
    for pitch in 60..64u8 {
        let mut sounding = 0i32;
        for message in &messages {
            if message[1] != pitch {
                continue;
            }
            match message[0] & 0xF0 {
                0x90 => {
                    assert_eq!(sounding, 0);
                    sounding += 1;
                }
                0x80 => {
                    assert_eq!(sounding, 1);
                    sounding -= 1;
                }
                _ => {}
            }
        }
        assert_eq!(sounding, 0);
    }
    play.close();
}

#[test]
fn closing_and_reopening_restores_a_clean_slate() {
    let capture = Capture::new();
    let registry = registry_with(&capture, "out");
    let mut organ = Organ::new();
    organ.add(rank(GREAT, "0-15"));
    let organ = Arc::new(Mutex::new(organ));

    let mut play = OrganPlay::new(organ.clone(), registry);
    play.open();
    play.set_engaged(GREAT, true);
    play.play_note(GREAT, 60, 100);
    play.close();

    // The derived flag survives in the disposition, so reopening re-engages;
    // counters do not survive, so the pitch can sound again.
    capture.clear();
    play.open();
    play.play_note(GREAT, 60, 100);

    let played: Vec<_> = capture
        .messages()
        .into_iter()
        .filter(|m| m[0] & 0xF0 == 0x90)
        .collect();
    assert_eq!(played, vec![[0x90, 60, 100]]);
    play.close();
}
