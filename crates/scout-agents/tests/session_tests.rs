//! Session behavior against scripted models: turns, eviction, partial
//! results and snapshots.

use std::time::{Duration, Instant};

use scout_agents::{PartialPolicy, Session, SessionError, Transcript};
use scout_engine::{EngineError, FinishReason, Message, Role};
use scout_runtime::{CancellationToken, Model};
use scout_sampling::SamplerConfig;
use scout_tokenizer::ChatTemplate;

fn session(replies: &[&str], capacity: usize) -> Session {
    let model = Model::scripted(replies, capacity).unwrap();
    Session::new(model, ChatTemplate::chatml())
        .with_sampler(SamplerConfig::greedy().with_max_new_tokens(32))
        .unwrap()
}

#[test]
fn concise_system_answers_deterministically() {
    let run = || {
        let mut s = session(&["4"], 512).with_system("You are concise.").unwrap();
        s.append(Message::user("2+2?")).unwrap();
        let result = s.generate_turn(None).unwrap();
        (result, s.messages().cloned().collect::<Vec<_>>())
    };
    let (first, history) = run();
    let (second, _) = run();

    assert_eq!(first, second);
    assert_eq!(first.text, "4");
    assert!(matches!(
        first.finish_reason,
        FinishReason::EosToken | FinishReason::StopSequence
    ));
    assert_eq!(history.len(), 2);
    assert_eq!(history[1], Message::assistant("4"));
}

#[test]
fn per_call_sampler_override_does_not_change_default() {
    let mut s = session(&["Hello there"], 512);
    s.append(Message::user("hi")).unwrap();
    let short = SamplerConfig::greedy().with_max_new_tokens(2);
    let result = s.generate_turn(Some(&short)).unwrap();
    assert_eq!(result.text, "He");
    assert_eq!(result.finish_reason, FinishReason::MaxTokens);
    assert_eq!(s.sampler().max_new_tokens, 32);
}

#[test]
fn long_conversation_stays_within_capacity() {
    let capacity = 160;
    let mut s = session(&["ok"], capacity).with_system("sys").unwrap();
    s.set_sampler(SamplerConfig::greedy().with_max_new_tokens(8))
        .unwrap();

    for i in 0..12 {
        s.append(Message::user(format!("message number {i}"))).unwrap();
        let result = s.generate_turn(None).unwrap();
        assert_eq!(result.text, "ok");
        assert!(s.token_count() <= capacity);
        assert_eq!(s.system_prompt(), Some("sys"));
    }
    // Older turns were evicted; the newest exchange is intact.
    assert!(s.len() < 24);
    let last: Vec<_> = s.messages().rev().take(2).cloned().collect();
    assert_eq!(last[0], Message::assistant("ok"));
    assert_eq!(last[1], Message::user("message number 11"));
}

#[test]
fn request_that_cannot_fit_fails_and_keeps_history() {
    let mut s = session(&["ok"], 64);
    s.set_sampler(SamplerConfig::greedy().with_max_new_tokens(8))
        .unwrap();

    // 6 framing tokens + 60 content bytes + 2 closing tokens.
    let err = s.append(Message::user("x".repeat(60))).unwrap_err();
    assert!(err.is_context_overflow());
    assert!(s.is_empty());

    // Fits on its own, but not together with the reply reservation.
    s.append(Message::user("y".repeat(40))).unwrap();
    let before = s.token_count();
    let err = s.generate_turn(None).unwrap_err();
    assert!(err.is_context_overflow());
    assert_eq!(s.len(), 1);
    assert_eq!(s.token_count(), before);
}

#[test]
fn cancelled_turn_respects_partial_policy() {
    for (policy, expect_appended) in [(PartialPolicy::Discard, false), (PartialPolicy::Retain, true)] {
        let mut s = session(&["Hello there"], 512);
        s.append(Message::user("hi")).unwrap();

        let cancel = CancellationToken::new();
        let mut seen = String::new();
        let result = s
            .generate_turn_with(None, cancel.clone(), policy, |fragment| {
                seen.push_str(fragment);
                cancel.cancel();
            })
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::Cancelled);
        assert_eq!(result.text, "H");
        assert_eq!(seen, "H");
        assert_eq!(s.len(), if expect_appended { 2 } else { 1 });
    }
}

#[test]
fn follow_up_turns_answer_in_order() {
    let mut s = session(&["first", "second"], 512);
    s.append(Message::user("one")).unwrap();
    assert_eq!(s.generate_turn(None).unwrap().text, "first");
    s.append(Message::user("two")).unwrap();
    assert_eq!(s.generate_turn(None).unwrap().text, "second");

    let roles: Vec<Role> = s.messages().map(|m| m.role).collect();
    assert_eq!(roles, [Role::User, Role::Assistant, Role::User, Role::Assistant]);
}

#[test]
fn empty_history_is_an_error() {
    let mut s = session(&["ok"], 128);
    assert!(matches!(s.generate_turn(None), Err(SessionError::EmptyHistory)));
}

#[test]
fn transcript_roundtrips_through_json() {
    let mut s = session(&["4"], 512).with_system("You are concise.").unwrap();
    s.append(Message::user("2+2?")).unwrap();
    s.generate_turn(None).unwrap();

    let json = serde_json::to_string(&s.transcript()).unwrap();
    let transcript: Transcript = serde_json::from_str(&json).unwrap();
    assert_eq!(transcript, s.transcript());

    let model = Model::scripted(&["again"], 512).unwrap();
    let restored = Session::restore(model, ChatTemplate::chatml(), transcript).unwrap();
    assert_eq!(restored.id(), s.id());
    assert_eq!(restored.system_prompt(), Some("You are concise."));
    assert_eq!(
        restored.messages().collect::<Vec<_>>(),
        s.messages().collect::<Vec<_>>()
    );
    assert_eq!(restored.token_count(), s.token_count());
}

#[test]
fn system_prompt_change_evicts_to_make_room() {
    let mut s = session(&["ok"], 64);
    s.append(Message::user("a".repeat(20))).unwrap();
    s.append(Message::user("b".repeat(20))).unwrap();
    assert_eq!(s.len(), 2);

    s.set_system_prompt(Some("c".repeat(20))).unwrap();
    assert!(s.token_count() <= 64);
    assert_eq!(s.len(), 1);
    assert_eq!(s.messages().next().unwrap().text(), "b".repeat(20));

    let err = s.set_system_prompt(Some("d".repeat(80))).unwrap_err();
    assert!(err.is_context_overflow());
    assert_eq!(s.system_prompt(), Some("c".repeat(20).as_str()));
}

#[test]
fn turn_timeout_fires_while_output_is_withheld() {
    let model = Model::scripted_with(&["a".repeat(200).as_str()], 512, |b| {
        b.with_step_delay(Duration::from_millis(5))
    })
    .unwrap();
    // Every generated byte is a prefix of this stop sequence, so no
    // fragment is released before the deadline.
    let sampler = SamplerConfig::greedy()
        .with_max_new_tokens(256)
        .with_stop_sequence(format!("{}Z", "a".repeat(250)));
    let mut s = Session::new(model, ChatTemplate::chatml())
        .with_sampler(sampler)
        .unwrap()
        .with_turn_timeout(Duration::from_millis(150));
    s.append(Message::user("go")).unwrap();

    let started = Instant::now();
    let mut fragments = 0;
    let err = s
        .generate_turn_with(None, CancellationToken::new(), PartialPolicy::Retain, |_| {
            fragments += 1;
        })
        .unwrap_err();

    assert!(matches!(err, SessionError::Engine(EngineError::Timeout)), "{err:?}");
    assert_eq!(fragments, 0);
    assert!(started.elapsed() < Duration::from_millis(700), "{:?}", started.elapsed());
    assert_eq!(s.len(), 1);
}

#[test]
fn failed_reply_takes_the_request_back() {
    let mut s = session(&["first", "second"], 512);
    s.append(Message::user("one")).unwrap();
    assert_eq!(s.reply(None).unwrap().text, "first");

    s.append(Message::user("two")).unwrap();
    let too_long = SamplerConfig::greedy().with_max_new_tokens(600);
    assert!(s.reply(Some(&too_long)).unwrap_err().is_context_overflow());
    assert_eq!(s.len(), 2);
    assert_eq!(s.messages().last().unwrap(), &Message::assistant("first"));

    // A discarded cancellation is unanswered too; a retained one is kept.
    s.append(Message::user("two")).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = s
        .reply_with(None, cancel, PartialPolicy::Discard, |_| {})
        .unwrap();
    assert_eq!(result.finish_reason, FinishReason::Cancelled);
    assert_eq!(s.len(), 2);

    s.append(Message::user("two")).unwrap();
    assert_eq!(s.reply(None).unwrap().text, "second");
    let roles: Vec<Role> = s.messages().map(|m| m.role).collect();
    assert_eq!(roles, [Role::User, Role::Assistant, Role::User, Role::Assistant]);
}
