use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use scout_agents::{
    GatewayConfig, PartialPolicy, Session, SessionError, SharedSession, StreamEvent,
    StreamingGateway,
};
use scout_engine::{FinishReason, Message};
use scout_runtime::Model;
use scout_sampling::SamplerConfig;
use scout_tokenizer::ChatTemplate;
use tokio::sync::Mutex;

fn shared(reply: &str, step_delay: Duration) -> SharedSession {
    let model = Model::scripted_with(&[reply], 512, |b| b.with_step_delay(step_delay)).unwrap();
    let mut session = Session::new(model, ChatTemplate::chatml())
        .with_sampler(SamplerConfig::greedy().with_max_new_tokens(64))
        .unwrap();
    session.append(Message::user("hi")).unwrap();
    Arc::new(Mutex::new(session))
}

#[tokio::test]
async fn fragments_arrive_in_order_before_done() {
    let session = shared("Hello there", Duration::ZERO);
    let gateway = StreamingGateway::default();
    let mut attachment = gateway.attach(session.clone(), None).unwrap();

    let mut text = String::new();
    let mut expected_index = 0;
    let result = loop {
        match attachment.next_event().await.unwrap() {
            StreamEvent::Fragment { index, text: t } => {
                assert_eq!(index, expected_index);
                expected_index += 1;
                text.push_str(&t);
            }
            StreamEvent::Done { result } => break result,
            StreamEvent::Error { message } => panic!("unexpected error: {message}"),
        }
    };
    assert!(attachment.next_event().await.is_none());

    assert_eq!(text, "Hello there");
    assert_eq!(result.text, "Hello there");
    assert!(expected_index > 1);

    let session = session.lock().await;
    assert_eq!(session.len(), 2);
    assert_eq!(
        session.messages().last().unwrap(),
        &Message::assistant("Hello there")
    );
}

#[tokio::test]
async fn stream_ends_with_a_single_terminal_event() {
    let session = shared("abc", Duration::ZERO);
    let gateway = StreamingGateway::default();
    let events: Vec<StreamEvent> = gateway
        .attach(session, Some(SamplerConfig::greedy().with_max_new_tokens(2)))
        .unwrap()
        .into_stream()
        .collect()
        .await;

    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    match events.last().unwrap() {
        StreamEvent::Done { result } => {
            assert_eq!(result.text, "ab");
            assert_eq!(result.finish_reason, FinishReason::MaxTokens);
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[tokio::test]
async fn cancel_stops_generation_and_discards_partial_reply() {
    let reply = "a reply long enough that cancellation lands in the middle";
    let session = shared(reply, Duration::from_millis(10));
    let gateway = StreamingGateway::default();
    let mut attachment = gateway.attach(session.clone(), None).unwrap();

    let first = attachment.next_event().await.unwrap();
    assert!(matches!(first, StreamEvent::Fragment { index: 0, .. }));
    attachment.cancel();

    let result = loop {
        match attachment.next_event().await.unwrap() {
            StreamEvent::Fragment { .. } => continue,
            StreamEvent::Done { result } => break result,
            StreamEvent::Error { message } => panic!("unexpected error: {message}"),
        }
    };
    assert_eq!(result.finish_reason, FinishReason::Cancelled);
    assert!(result.text.len() < reply.len());

    let session = session.lock().await;
    assert_eq!(session.len(), 1);
}

#[tokio::test]
async fn retain_policy_keeps_cancelled_text() {
    let session = shared("Hello there", Duration::from_millis(10));
    let gateway = StreamingGateway::new(GatewayConfig {
        partial: PartialPolicy::Retain,
        ..GatewayConfig::default()
    });
    let mut attachment = gateway.attach(session.clone(), None).unwrap();
    attachment.next_event().await.unwrap();
    attachment.cancel();

    let result = attachment.finish().await.unwrap();
    assert_eq!(result.finish_reason, FinishReason::Cancelled);

    let session = session.lock().await;
    assert_eq!(session.len(), 2);
    assert_eq!(session.messages().last().unwrap().text(), result.text);
}

#[tokio::test]
async fn second_attach_while_running_is_busy() {
    let session = shared("Hello there", Duration::from_millis(10));
    let gateway = StreamingGateway::default();
    let attachment = gateway.attach(session.clone(), None).unwrap();

    assert!(matches!(
        gateway.attach(session.clone(), None),
        Err(SessionError::Busy)
    ));

    attachment.finish().await.unwrap();
    // Free again once the turn is over.
    session.lock().await.append(Message::user("again")).unwrap();
    gateway.attach(session, None).unwrap().finish().await.unwrap();
}

#[tokio::test]
async fn dropping_the_consumer_cancels_the_turn() {
    let session = shared("Hello there", Duration::from_millis(5));
    let gateway = StreamingGateway::new(GatewayConfig {
        buffer: 1,
        ..GatewayConfig::default()
    });
    let attachment = gateway.attach(session.clone(), None).unwrap();

    let result = attachment.finish().await.unwrap();
    assert_eq!(result.finish_reason, FinishReason::Cancelled);
    assert_eq!(session.lock().await.len(), 1);
}

#[tokio::test]
async fn abandoned_reply_leaves_no_unanswered_request() {
    let session = shared("Hello there", Duration::from_millis(5));
    let gateway = StreamingGateway::default();

    let mut held = session.clone().lock_owned().await;
    held.append(Message::user("and then?")).unwrap();
    assert_eq!(held.len(), 2);
    let attachment = gateway.attach_reply(held, None);
    // The lock travels with the turn.
    assert!(matches!(
        gateway.attach(session.clone(), None),
        Err(SessionError::Busy)
    ));

    drop(attachment.into_stream());
    // Wait for the worker to release the session.
    let session = session.lock().await;
    assert_eq!(session.len(), 1);
    assert_eq!(session.messages().last().unwrap(), &Message::user("hi"));
}

#[test]
fn events_serialize_with_type_tag() {
    let event = StreamEvent::Fragment {
        index: 3,
        text: "hi".into(),
    };
    assert_eq!(
        serde_json::to_value(&event).unwrap(),
        serde_json::json!({"type": "fragment", "index": 3, "text": "hi"})
    );
}
