//! End-to-end scenarios against a scripted in-memory transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use weft_client::{
    Client, ClientError, HttpRequest, HttpResponse, HttpTransport, LoginData, TimelineEntry,
};
use weft_core::RoomId;

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: String,
    url: String,
    bearer: Option<String>,
    body: Option<Value>,
}

/// Transport that answers from a scripted FIFO of responses and records
/// every request it sees. `pause` holds requests until `resume`, which the
/// concurrency tests use to keep a request in flight.
struct FakeTransport {
    responses: Mutex<VecDeque<(u16, Value)>>,
    requests: Mutex<Vec<RecordedRequest>>,
    paused: Mutex<bool>,
    release: Notify,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            paused: Mutex::new(false),
            release: Notify::new(),
        })
    }

    fn push_response(&self, status: u16, body: Value) {
        self.responses
            .lock()
            .expect("response lock")
            .push_back((status, body));
    }

    fn requests_matching(&self, fragment: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .expect("request lock")
            .iter()
            .filter(|request| request.url.contains(fragment))
            .cloned()
            .collect()
    }

    fn pause(&self) {
        *self.paused.lock().expect("pause lock") = true;
    }

    fn resume(&self) {
        *self.paused.lock().expect("pause lock") = false;
        self.release.notify_waiters();
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        self.requests.lock().expect("request lock").push(RecordedRequest {
            method: request.method.to_string(),
            url: request.url.to_string(),
            bearer: request.bearer.clone(),
            body: request.body.clone(),
        });

        loop {
            let notified = self.release.notified();
            if !*self.paused.lock().expect("pause lock") {
                break;
            }
            notified.await;
        }

        let (status, body) = self
            .responses
            .lock()
            .expect("response lock")
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request: {} {}", request.method, request.url));
        Ok(HttpResponse {
            status,
            body: body.to_string(),
        })
    }
}

fn logged_in_client(transport: Arc<FakeTransport>) -> Client {
    let data = LoginData {
        homeserver: "https://h.example.org".to_owned(),
        access_token: Some("A".to_owned()),
        refresh_token: Some("R".to_owned()),
        user_id: Some("@alice:h".into()),
        device_id: Some("D".to_owned()),
        expires_at_ms: None,
    };
    Client::with_transport(&data, transport).expect("client should build")
}

fn message(event_id: &str, body: &str) -> Value {
    json!({
        "type": "m.room.message",
        "event_id": event_id,
        "sender": "@alice:h",
        "origin_server_ts": 1_700_000_000_000_u64,
        "content": { "msgtype": "m.text", "body": body }
    })
}

fn shape(entries: &[TimelineEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| match entry {
            TimelineEntry::Event(with_state) => with_state
                .event
                .event_id()
                .map(|id| id.as_str().to_owned())
                .unwrap_or_default(),
            TimelineEntry::Gap { from, to } => format!(
                "gap({},{})",
                from.clone().unwrap_or_default(),
                to.clone().unwrap_or_default()
            ),
        })
        .collect()
}

#[tokio::test]
async fn password_login_sets_tokens() {
    let transport = FakeTransport::new();
    transport.push_response(
        200,
        json!({
            "access_token": "A",
            "refresh_token": "R",
            "user_id": "@alice:h",
            "device_id": "D",
            "expires_in_ms": 3_600_000
        }),
    );
    let client = Client::with_transport(&LoginData::new("https://h.example.org"), transport.clone())
        .expect("client should build");

    client
        .password_login("alice", "p", None, None)
        .await
        .expect("login should work");

    assert!(client.logged_in().expect("logged_in works"));
    assert!(!client.expired().expect("expired works"));

    let data = client.to_login_data().expect("export works");
    assert_eq!(data.access_token.as_deref(), Some("A"));
    assert_eq!(data.refresh_token.as_deref(), Some("R"));
    assert_eq!(data.user_id, Some("@alice:h".into()));
    assert_eq!(data.device_id.as_deref(), Some("D"));

    let expiry = UNIX_EPOCH + Duration::from_millis(data.expires_at_ms.expect("expiry is set"));
    assert!(!client.expired_at(expiry).expect("expiry check works"));
    assert!(
        client
            .expired_at(expiry + Duration::from_millis(1))
            .expect("expiry check works")
    );

    let login = &transport.requests_matching("/login")[0];
    let body = login.body.as_ref().expect("login carries a body");
    assert_eq!(body["type"], "m.login.password");
    assert_eq!(
        body["identifier"],
        json!({ "type": "m.id.user", "user": "alice" })
    );
    assert_eq!(body["password"], "p");
}

#[tokio::test]
async fn soft_logout_refreshes_and_replays() {
    let transport = FakeTransport::new();
    transport.push_response(
        401,
        json!({ "errcode": "M_UNKNOWN_TOKEN", "error": "soft logout", "soft_logout": true }),
    );
    transport.push_response(200, json!({ "access_token": "A2", "expires_in_ms": 60_000 }));
    transport.push_response(200, json!({ "joined_rooms": ["!r:h"] }));
    let client = logged_in_client(transport.clone());

    #[allow(deprecated)]
    let rooms = client
        .get_joined_rooms()
        .await
        .expect("call should succeed after replay");
    assert_eq!(rooms, vec![RoomId::from("!r:h")]);

    let joined = transport.requests_matching("/joined_rooms");
    assert_eq!(joined.len(), 2, "exactly two dispatches");
    assert_eq!(joined[0].bearer.as_deref(), Some("A"));
    assert_eq!(
        joined[1].bearer.as_deref(),
        Some("A2"),
        "replay must use the refreshed token"
    );

    let refresh = transport.requests_matching("/refresh");
    assert_eq!(refresh.len(), 1);
    assert_eq!(
        refresh[0].body.as_ref().expect("refresh carries a body")["refresh_token"],
        "R"
    );
}

#[tokio::test]
async fn hard_unknown_token_clears_session() {
    let transport = FakeTransport::new();
    transport.push_response(401, json!({ "errcode": "M_UNKNOWN_TOKEN", "error": "bye" }));
    let client = logged_in_client(transport.clone());

    #[allow(deprecated)]
    let err = client
        .get_joined_rooms()
        .await
        .expect_err("hard logout must fail");
    assert_eq!(err, ClientError::LoginRequired);
    assert!(!client.logged_in().expect("logged_in works"));
}

#[tokio::test]
async fn other_matrix_errors_propagate() {
    let transport = FakeTransport::new();
    transport.push_response(
        429,
        json!({ "errcode": "M_LIMIT_EXCEEDED", "error": "slow down", "retry_after_ms": 2000 }),
    );
    let client = logged_in_client(transport.clone());

    #[allow(deprecated)]
    let err = client
        .get_joined_rooms()
        .await
        .expect_err("rate limit must propagate");
    assert_eq!(
        err,
        ClientError::MatrixApi {
            errcode: "M_LIMIT_EXCEEDED".to_owned(),
            error: "slow down".to_owned(),
            http_status: 429,
            retry_after_ms: Some(2000),
        }
    );
}

#[tokio::test]
async fn gap_is_detected_and_filled_forward() {
    let transport = FakeTransport::new();
    let client = logged_in_client(transport.clone());
    let room = RoomId::from("!r:h");

    transport.push_response(
        200,
        json!({
            "next_batch": "b1",
            "rooms": { "join": { "!r:h": {
                "timeline": { "events": [message("$e0", "zero")], "prev_batch": "p0" }
            } } }
        }),
    );
    client.sync(Duration::ZERO).await.expect("first sync works");
    assert_eq!(client.next_batch().expect("batch works").as_deref(), Some("b1"));

    transport.push_response(
        200,
        json!({
            "next_batch": "b3",
            "rooms": { "join": { "!r:h": {
                "timeline": { "events": [message("$e3", "three")], "prev_batch": "b2" }
            } } }
        }),
    );
    client.sync(Duration::ZERO).await.expect("second sync works");

    let sync = transport.requests_matching("/sync");
    assert_eq!(sync.len(), 2);
    assert!(sync[1].url.contains("since=b1"), "second sync advances since");

    let entries = client
        .timeline_entries(&room)
        .expect("entries work")
        .expect("room is known");
    assert_eq!(shape(&entries), vec!["$e0", "gap(b1,b2)", "$e3"]);

    // Crossing the gap lazily materializes the missing range.
    let first = client
        .room_first(&room)
        .expect("first works")
        .expect("room has events");
    assert!(
        first.next_sync().expect("next_sync works").is_none(),
        "next_sync must not cross a gap"
    );

    transport.push_response(
        200,
        json!({
            "start": "b1",
            "end": "b1.5",
            "state": [],
            "chunk": [message("$e1", "one"), message("$e2", "two")]
        }),
    );
    let next = first
        .next()
        .await
        .expect("hole fill works")
        .expect("fill yields an event");
    assert_eq!(next.event_id(), Some(&"$e1".into()));

    let messages = transport.requests_matching("/messages");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].url.contains("dir=f"));
    assert!(messages[0].url.contains("from=b1"));
    assert!(messages[0].url.contains("to=b2"));

    let entries = client
        .timeline_entries(&room)
        .expect("entries work")
        .expect("room is known");
    assert_eq!(
        shape(&entries),
        vec!["$e0", "$e1", "$e2", "gap(b1.5,b2)", "$e3"]
    );
}

#[tokio::test]
async fn backward_traversal_fills_history() {
    let transport = FakeTransport::new();
    let client = logged_in_client(transport.clone());
    let room = RoomId::from("!r:h");

    transport.push_response(
        200,
        json!({
            "next_batch": "b1",
            "rooms": { "join": { "!r:h": {
                "timeline": { "events": [message("$e0", "zero")], "prev_batch": "p0" }
            } } }
        }),
    );
    client.sync(Duration::ZERO).await.expect("first sync works");

    transport.push_response(
        200,
        json!({
            "next_batch": "b3",
            "rooms": { "join": { "!r:h": {
                "timeline": { "events": [message("$e3", "three")], "prev_batch": "b2" }
            } } }
        }),
    );
    client.sync(Duration::ZERO).await.expect("second sync works");

    transport.push_response(
        200,
        json!({
            "start": "b2",
            "end": "b1.5",
            "state": [],
            "chunk": [message("$e2", "two"), message("$e1", "one")]
        }),
    );
    let last = client
        .room_last(&room)
        .expect("last works")
        .expect("room has events");
    let previous = last
        .previous()
        .await
        .expect("hole fill works")
        .expect("fill yields an event");
    assert_eq!(previous.event_id(), Some(&"$e2".into()));

    let messages = transport.requests_matching("/messages");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].url.contains("dir=b"));
    assert!(messages[0].url.contains("from=b2"));
    assert!(messages[0].url.contains("to=b1"));

    let entries = client
        .timeline_entries(&room)
        .expect("entries work")
        .expect("room is known");
    assert_eq!(
        shape(&entries),
        vec!["$e0", "gap(b1,b1.5)", "$e1", "$e2", "$e3"]
    );
}

#[tokio::test]
async fn synced_redaction_rewrites_stored_event() {
    let transport = FakeTransport::new();
    let client = logged_in_client(transport.clone());
    let room = RoomId::from("!r:h");

    transport.push_response(
        200,
        json!({
            "next_batch": "b1",
            "rooms": { "join": { "!r:h": {
                "timeline": { "events": [message("$e1", "x")] }
            } } }
        }),
    );
    client.sync(Duration::ZERO).await.expect("first sync works");

    transport.push_response(
        200,
        json!({
            "next_batch": "b2",
            "rooms": { "join": { "!r:h": {
                "timeline": {
                    "events": [{
                        "type": "m.room.redaction",
                        "event_id": "$e2",
                        "sender": "@mod:h",
                        "content": { "redacts": "$e1" }
                    }],
                    "prev_batch": "b1"
                }
            } } }
        }),
    );
    client.sync(Duration::ZERO).await.expect("second sync works");

    let handle = client
        .event(&"$e1".into())
        .expect("lookup works")
        .expect("event stays indexed");
    let value = handle.value().expect("value works");
    assert!(value.event.is_redacted());
    let because = value
        .event
        .unsigned
        .as_ref()
        .and_then(|unsigned| unsigned.redacted_because.as_deref())
        .expect("redaction reference is present");
    assert_eq!(because.event_id(), Some(&"$e2".into()));

    let entries = client
        .timeline_entries(&room)
        .expect("entries work")
        .expect("room is known");
    assert_eq!(
        shape(&entries),
        vec!["$e1", "$e2"],
        "timeline position is preserved"
    );
}

#[tokio::test]
async fn concurrent_syncs_issue_one_request() {
    let transport = FakeTransport::new();
    transport.push_response(200, json!({ "next_batch": "b1" }));
    transport.pause();
    let client = logged_in_client(transport.clone());

    let first = client.clone();
    let second = client.clone();
    let task_one = tokio::spawn(async move { first.sync(Duration::ZERO).await });
    let task_two = tokio::spawn(async move { second.sync(Duration::ZERO).await });

    // Let both calls reach the gate while the request is held in flight.
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    transport.resume();

    task_one
        .await
        .expect("task one completes")
        .expect("sync one works");
    task_two
        .await
        .expect("task two completes")
        .expect("sync two works");

    assert_eq!(
        transport.requests_matching("/sync").len(),
        1,
        "two concurrent sync calls collapse into one request"
    );
}

#[tokio::test]
async fn send_paths_carry_transaction_ids() {
    let transport = FakeTransport::new();
    transport.push_response(200, json!({ "event_id": "$sent" }));
    transport.push_response(200, json!({ "event_id": "$redaction" }));
    let client = logged_in_client(transport.clone());
    let room = RoomId::from("!r:h");

    let event_id = client
        .send_text_message(&room, "hello")
        .await
        .expect("send works");
    assert_eq!(event_id, "$sent".into());

    client
        .redact(&room, &event_id, Some("mistake"))
        .await
        .expect("redact works");

    let send = &transport.requests_matching("/send/")[0];
    assert_eq!(send.method, "PUT");
    assert_eq!(
        send.body.as_ref().expect("send carries content"),
        &json!({ "msgtype": "m.text", "body": "hello" })
    );
    let txn = send
        .url
        .rsplit('/')
        .next()
        .expect("send path ends with a transaction id");
    assert_eq!(
        uuid::Uuid::parse_str(txn).expect("transaction id is a uuid").get_version_num(),
        4
    );

    let redact = &transport.requests_matching("/redact/")[0];
    assert_eq!(redact.method, "PUT");
    assert_eq!(
        redact.body.as_ref().expect("redact carries a body"),
        &json!({ "reason": "mistake" })
    );
}
