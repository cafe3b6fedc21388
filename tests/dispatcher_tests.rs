//! Broker dispatcher behavior, driven without sockets.
//!
//! Messages are fed in exactly as the ROUTER sockets deliver them (envelope
//! first) and the outbox is inspected for what would go on the wire.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::json;
use zmws::broker::{Dispatcher, Outbound, Route};
use zmws::config::{BrokerConfig, HeartbeatConfig};
use zmws::protocol::wire::{AnswerStatus, REPLY, REQUEST};
use zmws::protocol::{ClientReply, Identity, Message};
use zmws::scheduler::{JobId, JobState};

const INTERVAL: Duration = Duration::from_secs(1);

fn dispatcher(now: Instant) -> Dispatcher {
    let config = BrokerConfig::new(5555, 5556).with_heartbeat(HeartbeatConfig::new(INTERVAL, 3));
    Dispatcher::new(&config, now)
}

fn msg(frames: &[&[u8]]) -> Message {
    Message::from_frames(frames.iter().map(|f| Bytes::copy_from_slice(f)))
}

fn frames(msg: &Message) -> Vec<Bytes> {
    msg.frames().cloned().collect()
}

fn routed(out: &[Outbound], route: Route) -> Vec<Message> {
    out.iter()
        .filter(|o| o.route == route)
        .map(|o| o.message.clone())
        .collect()
}

/// `[client, "", MDPC02, 0x01, param, job]`
fn request(client: &str, job: &str, param: &[u8]) -> Message {
    msg(&[client.as_bytes(), b"", b"MDPC02", &[REQUEST], param, job.as_bytes()])
}

fn ready(d: &mut Dispatcher, worker: &str, service: &str, now: Instant) {
    d.handle_back(msg(&[worker.as_bytes(), service.as_bytes(), b"READY"]), now);
}

fn answer(d: &mut Dispatcher, worker: &str, body: &str, payload: Option<&[u8]>, now: Instant) {
    let m = match payload {
        Some(p) => msg(&[worker.as_bytes(), b"ECHO", p, body.as_bytes()]),
        None => msg(&[worker.as_bytes(), b"ECHO", body.as_bytes()]),
    };
    d.handle_back(m, now);
}

fn only_pending_id(d: &Dispatcher) -> JobId {
    assert_eq!(d.jobs().pending_len(), 1);
    d.jobs().pending().next().unwrap().id.clone()
}

/// Strip the client envelope and parse what the client would see.
fn client_view(mut m: Message) -> ClientReply {
    m.pop_front().unwrap();
    ClientReply::parse(m).unwrap()
}

#[test]
fn test_unknown_service_fails_fast() {
    let now = Instant::now();
    let mut d = dispatcher(now);

    d.handle_front(request("c1", "JOB: SLOW", b""));

    let out = d.drain_outbox();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].route, Route::Frontend);
    assert_eq!(
        frames(&out[0].message),
        vec![Bytes::from("c1"), Bytes::new(), Bytes::from("FAIL: SLOW")]
    );
    assert_eq!(d.jobs().pending_len(), 0);
}

#[test]
fn test_protocol_violation_is_rejected() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);

    d.handle_front(msg(&[b"c1", b"", b"MDPC01", &[REQUEST], b"", b"JOB: ECHO"]));
    d.handle_front(msg(&[b"c1", b"", b"MDPC02", &[0x07], b"", b"JOB: ECHO"]));
    d.handle_front(msg(&[b"c1", b"", b"JOB: ECHO"]));

    let out = d.drain_outbox();
    assert_eq!(out.len(), 3);
    for o in &out {
        assert_eq!(client_view(o.message.clone()), ClientReply::Rejected { job: "ECHO".into() });
    }
    assert_eq!(d.jobs().pending_len(), 0);
}

#[test]
fn test_ascii_request_type_is_accepted() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);

    d.handle_front(msg(&[b"c1", b"", b"MDPC02", b"1", b"", b"JOB: ECHO"]));
    assert_eq!(d.jobs().pending_len(), 1);
}

#[test]
fn test_async_job_is_acknowledged_once() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);

    d.handle_front(request("c1", "JOB: ECHO", b""));
    let id = only_pending_id(&d);
    let out = d.drain_outbox();
    assert_eq!(out.len(), 1);
    assert_eq!(
        client_view(out[0].message.clone()),
        ClientReply::Accepted {
            job_id: id.to_string(),
            service: "ECHO".into()
        }
    );

    d.tick(now);
    answer(&mut d, "w1", &format!("COMPLETE: {}", id), Some(b"PARAM-JSON: 1"), now);

    let out = d.drain_outbox();
    assert!(routed(&out, Route::Frontend).is_empty());
    assert_eq!(d.jobs().history_len(), 1);
}

#[test]
fn test_sync_echo_returns_payload_verbatim() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);

    let param = br#"PARAM-JSON: {"x":1}"#;
    d.handle_front(request("c1", "JOB: SYNC-ECHO", param));
    let id = only_pending_id(&d);
    assert!(d.drain_outbox().is_empty(), "sync jobs get no acknowledgment");

    assert_eq!(d.start_jobs(), 1);
    let out = d.drain_outbox();
    let dispatched = routed(&out, Route::Backend);
    assert_eq!(dispatched.len(), 1);
    assert_eq!(
        frames(&dispatched[0]),
        vec![
            Bytes::from("w1"),
            Bytes::new(),
            Bytes::from("MDPC02"),
            Bytes::from_static(&[REQUEST]),
            Bytes::copy_from_slice(param),
            Bytes::from(format!("JOB: {}", id)),
        ]
    );

    answer(&mut d, "w1", &format!("COMPLETE: {}", id), Some(param), now);
    let out = d.drain_outbox();
    let replies = routed(&out, Route::Frontend);
    assert_eq!(replies.len(), 1);
    assert_eq!(
        frames(&replies[0]),
        vec![
            Bytes::from("c1"),
            Bytes::new(),
            Bytes::from("ECHO"),
            Bytes::from_static(&[REPLY]),
            Bytes::from("MDPC02"),
            Bytes::from(format!("COMPLETE: ECHO [{}]", id)),
            Bytes::copy_from_slice(param),
        ]
    );
    assert_eq!(
        client_view(replies[0].clone()),
        ClientReply::Answer {
            status: AnswerStatus::Complete,
            service: "ECHO".into(),
            job_id: id.to_string(),
            payload: Some(json!({"x": 1})),
        }
    );

    assert_eq!(d.jobs().locate(&id), Some(JobState::Completed));
    assert!(!d.workers().is_busy(&Identity::from("w1")));
}

#[test]
fn test_worker_failure_is_forwarded_to_sync_client() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: SYNC-ECHO", b""));
    let id = only_pending_id(&d);
    d.start_jobs();
    d.drain_outbox();

    answer(&mut d, "w1", &format!("FAIL: {}", id), None, now);
    let out = d.drain_outbox();
    let replies = routed(&out, Route::Frontend);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].frame_count(), 6);
    assert!(matches!(
        client_view(replies[0].clone()),
        ClientReply::Answer { status: AnswerStatus::Fail, payload: None, .. }
    ));
    assert_eq!(d.jobs().locate(&id), Some(JobState::Failed));
    assert_eq!(d.select_worker("ECHO"), Some(Identity::from("w1")));
}

#[test]
fn test_cont_forwards_without_releasing_worker() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: SYNC-ECHO", b""));
    let id = only_pending_id(&d);
    d.start_jobs();
    d.drain_outbox();

    answer(&mut d, "w1", &format!("CONT: {}", id), Some(b"PARAM-JSON: \"half\""), now);
    let out = d.drain_outbox();
    let replies = routed(&out, Route::Frontend);
    assert_eq!(replies.len(), 1);
    assert_eq!(
        client_view(replies[0].clone()),
        ClientReply::Answer {
            status: AnswerStatus::Cont,
            service: "ECHO".into(),
            job_id: id.to_string(),
            payload: Some(json!("half")),
        }
    );
    assert!(routed(&out, Route::News).is_empty());
    assert_eq!(d.jobs().locate(&id), Some(JobState::Active));
    assert!(d.workers().is_busy(&Identity::from("w1")));
}

#[test]
fn test_cont_for_async_job_is_not_forwarded() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: ECHO", b""));
    let id = only_pending_id(&d);
    d.start_jobs();
    d.drain_outbox();

    answer(&mut d, "w1", &format!("CONT: {}", id), Some(b"PARAM-JSON: 1"), now);
    assert!(d.drain_outbox().is_empty());
    assert_eq!(d.jobs().locate(&id), Some(JobState::Active));
}

#[test]
fn test_finished_jobs_are_announced_on_news() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: ECHO", b""));
    let id = only_pending_id(&d);
    d.start_jobs();
    d.drain_outbox();

    answer(&mut d, "w1", &format!("COMPLETE: {}", id), None, now);
    let out = d.drain_outbox();
    let news = routed(&out, Route::News);
    assert_eq!(news.len(), 1);
    assert_eq!(
        frames(&news[0]),
        vec![Bytes::from("ECHO"), Bytes::from(format!("COMPLETE: ECHO [{}]", id))]
    );
}

#[test]
fn test_purged_worker_job_is_requeued_at_head() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: SYNC-ECHO", b"p"));
    let id = only_pending_id(&d);
    d.start_jobs();
    d.handle_front(request("c2", "JOB: ECHO", b""));
    d.drain_outbox();
    assert_eq!(d.jobs().pending_len(), 1);

    // 3 intervals without contact expire the worker.
    d.tick(now + Duration::from_secs(4));

    assert!(d.workers().is_empty());
    assert_eq!(d.jobs().active_len(), 0);
    assert_eq!(d.jobs().pending_len(), 2);
    let head = d.jobs().pending().next().unwrap();
    assert_eq!(head.id, id);
    assert_eq!(head.state, JobState::Queued);
    assert!(head.assigned_worker.is_none());
    assert_eq!(head.service, "ECHO");
    assert_eq!(head.client_id, Identity::from("c1"));
    assert_eq!(head.param, Bytes::from("p"));

    // The service stays known, so new requests still queue.
    d.handle_front(request("c3", "JOB: ECHO", b""));
    assert_eq!(d.jobs().pending_len(), 3);
}

#[test]
fn test_requeued_job_goes_to_next_worker() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: ECHO", b""));
    let id = only_pending_id(&d);
    d.start_jobs();
    d.drain_outbox();

    let later = now + Duration::from_secs(4);
    ready(&mut d, "w2", "ECHO", later);
    d.tick(later);

    let job = d.jobs().get_active(&id).unwrap();
    assert_eq!(job.assigned_worker, Some(Identity::from("w2")));
}

#[test]
fn test_any_contact_keeps_worker_alive() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);

    d.handle_back(msg(&[b"w1", b"HEARTBEAT"]), now + Duration::from_secs(2));
    d.tick(now + Duration::from_secs(4));
    assert!(d.workers().is_known(&Identity::from("w1")));

    d.tick(now + Duration::from_secs(6));
    assert!(!d.workers().is_known(&Identity::from("w1")));
}

#[test]
fn test_heartbeats_go_to_idle_workers_when_due() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "idle", "ECHO", now);
    ready(&mut d, "busy", "SLEEP", now);
    d.handle_front(request("c1", "JOB: SLEEP", b""));
    d.start_jobs();
    d.drain_outbox();

    d.tick(now + Duration::from_millis(500));
    assert!(d.drain_outbox().is_empty());

    d.tick(now + INTERVAL);
    let out = d.drain_outbox();
    let beats = routed(&out, Route::Backend);
    assert_eq!(beats.len(), 1);
    assert_eq!(frames(&beats[0]), vec![Bytes::from("idle"), Bytes::from("HEARTBEAT")]);

    // Next heartbeat is a full interval later.
    d.tick(now + INTERVAL + Duration::from_millis(500));
    assert!(d.drain_outbox().is_empty());
}

#[test]
fn test_busy_service_does_not_block_other_services() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "slow-1", "SLOW", now);
    ready(&mut d, "echo-1", "ECHO", now);

    d.handle_front(request("c1", "JOB: SLOW", b""));
    d.handle_front(request("c1", "JOB: SLOW", b""));
    d.handle_front(request("c1", "JOB: ECHO", b""));
    d.drain_outbox();

    assert_eq!(d.start_jobs(), 2);
    assert_eq!(d.jobs().active_len(), 2);
    assert_eq!(d.jobs().pending_len(), 1);
    assert_eq!(d.jobs().pending().next().unwrap().service, "SLOW");
    assert_eq!(d.select_worker("SLOW"), None);
    assert_eq!(d.select_worker("ECHO"), None);
}

#[test]
fn test_jobs_dispatch_in_fifo_order() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: ECHO", b"first"));
    d.handle_front(request("c1", "JOB: ECHO", b"second"));
    d.drain_outbox();

    d.start_jobs();
    let out = d.drain_outbox();
    let dispatched = routed(&out, Route::Backend);
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].get(4), Some(&Bytes::from("first")));
}

#[test]
fn test_answers_from_unknown_workers_are_ignored() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: SYNC-ECHO", b""));
    let id = only_pending_id(&d);
    d.start_jobs();
    d.drain_outbox();

    answer(&mut d, "ghost", &format!("COMPLETE: {}", id), None, now);
    assert!(d.drain_outbox().is_empty());
    assert_eq!(d.jobs().locate(&id), Some(JobState::Active));
    assert!(!d.workers().is_known(&Identity::from("ghost")));
}

#[test]
fn test_answer_for_job_held_by_another_worker_is_ignored() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: SYNC-ECHO", b""));
    let id = only_pending_id(&d);
    d.start_jobs();
    ready(&mut d, "w2", "ECHO", now);
    d.drain_outbox();

    answer(&mut d, "w2", &format!("COMPLETE: {}", id), None, now);
    assert!(d.drain_outbox().is_empty());
    assert_eq!(
        d.jobs().get_active(&id).unwrap().assigned_worker,
        Some(Identity::from("w1"))
    );

    answer(&mut d, "w1", "COMPLETE: 00000000", None, now);
    assert!(d.drain_outbox().is_empty());
    assert!(d.workers().is_busy(&Identity::from("w1")));
}

#[test]
fn test_ready_while_holding_job_requeues_it() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    d.handle_front(request("c1", "JOB: ECHO", b""));
    let id = only_pending_id(&d);
    d.start_jobs();

    ready(&mut d, "w1", "ECHO", now);
    assert_eq!(d.jobs().locate(&id), Some(JobState::Queued));
    assert!(!d.workers().is_busy(&Identity::from("w1")));
    assert_eq!(d.workers().service_len("ECHO"), 1);
}

#[test]
fn test_admin_queries_bypass_the_queue() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    ready(&mut d, "w1", "ECHO", now);
    ready(&mut d, "w2", "ECHO", now);
    d.handle_front(request("c1", "JOB: ECHO", b""));
    d.handle_front(request("c1", "JOB: ECHO", b""));
    d.handle_front(request("c1", "JOB: ECHO", b""));
    d.start_jobs();
    let done = d.jobs().active().next().unwrap().clone();
    let worker = done.assigned_worker.clone().unwrap().to_string();
    answer(&mut d, &worker, &format!("COMPLETE: {}", done.id), None, now);
    d.drain_outbox();

    let query = |d: &mut Dispatcher, name: &str| {
        d.handle_front(msg(&[b"admin", b"", name.as_bytes()]));
        let out = d.drain_outbox();
        assert_eq!(out.len(), 1);
        match client_view(out[0].message.clone()) {
            ClientReply::Data(value) => value,
            other => panic!("unexpected reply {:?}", other),
        }
    };

    let jobs = query(&mut d, "JOB: SERVER-JOBS");
    assert_eq!(jobs.as_array().unwrap().len(), 1);
    assert_eq!(jobs[0]["state"], "queued");

    let active = query(&mut d, "JOB: SERVER-ACTIVE");
    assert_eq!(active.as_array().unwrap().len(), 1);
    assert_eq!(active[0]["state"], "active");

    let history = query(&mut d, "JOB: SERVER-HIST");
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["id"], done.id.as_str());
    assert_eq!(history[0]["state"], "completed");

    let workers = query(&mut d, "SERVER-WORKERS");
    assert_eq!(workers.as_array().unwrap().len(), 2);
    assert_eq!(d.jobs().pending_len(), 1);
}

#[test]
fn test_worker_message_without_envelope_is_dropped() {
    let now = Instant::now();
    let mut d = dispatcher(now);
    d.handle_back(Message::new(), now);
    d.handle_front(Message::new());
    d.handle_back(msg(&[b"w1", b"READY"]), now);
    assert!(d.drain_outbox().is_empty());
    assert!(d.workers().is_empty());
}
