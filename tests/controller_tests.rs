//! End-to-end tests for the chat controller
//!
//! Drives whole turns against a mock proxy and the in-memory store

mod common;

use async_trait::async_trait;
use chatfren::ai::{ChatError, ProxyClient};
use chatfren::auth::Anonymous;
use chatfren::chat::{ChatController, ChatView, Notice, TurnPhase};
use chatfren::store::{ChatStore, MemoryStore, StoreError, StoreResult, Subscription};
use chatfren::types::{ChatMode, Conversation, ConversationId, Message, Role};
use common::{client_for, data_line, read_request, sse_body};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingView {
    renders: Vec<(ConversationId, Vec<Message>)>,
    loading: Vec<bool>,
    notices: Vec<Notice>,
    /// Fired the first time a render shows a message with this content.
    waiter: Option<(String, oneshot::Sender<()>)>,
}

impl ChatView for RecordingView {
    fn render(&mut self, conversation: &Conversation, messages: &[Message]) {
        let seen = self
            .waiter
            .as_ref()
            .is_some_and(|(content, _)| messages.iter().any(|m| &m.content == content));
        if seen {
            if let Some((_, tx)) = self.waiter.take() {
                let _ = tx.send(());
            }
        }
        self.renders.push((conversation.id, messages.to_vec()));
    }

    fn set_loading(&mut self, loading: bool) {
        self.loading.push(loading);
    }

    fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }
}

/// Store whose inserts fail for one role.
#[derive(Clone)]
struct FlakyStore {
    inner: MemoryStore,
    failing_role: Role,
}

#[async_trait]
impl ChatStore for FlakyStore {
    async fn create_conversation(&self, title: &str, mode: ChatMode) -> StoreResult<Conversation> {
        self.inner.create_conversation(title, mode).await
    }

    async fn list_conversations(&self) -> StoreResult<Vec<Conversation>> {
        self.inner.list_conversations().await
    }

    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Conversation> {
        self.inner.get_conversation(id).await
    }

    async fn rename_conversation(&self, id: ConversationId, title: &str) -> StoreResult<()> {
        self.inner.rename_conversation(id, title).await
    }

    async fn set_conversation_mode(&self, id: ConversationId, mode: ChatMode) -> StoreResult<()> {
        self.inner.set_conversation_mode(id, mode).await
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        self.inner.list_messages(conversation_id).await
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
    ) -> StoreResult<Message> {
        if role == self.failing_role {
            return Err(StoreError::Backend("insert rejected".to_string()));
        }
        self.inner.insert_message(conversation_id, role, content).await
    }

    async fn subscribe(&self, conversation_id: ConversationId) -> StoreResult<Subscription> {
        self.inner.subscribe(conversation_id).await
    }
}

async fn mount_reply(server: &MockServer, pieces: &[&str]) {
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body(pieces), "text/event-stream"),
        )
        .mount(server)
        .await;
}

fn summary(messages: &[Message]) -> Vec<(Role, &str)> {
    messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect()
}

#[tokio::test]
async fn test_hello_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(body_json(json!({
            "messages": [{"role": "user", "content": "Hello"}],
            "mode": "friendly"
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["Hi", " there"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let mut controller = ChatController::new(
        store.clone(),
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    controller.send_message("Hello").await.unwrap();
    controller.drain_pushes();

    let expected = vec![(Role::User, "Hello"), (Role::Assistant, "Hi there")];
    assert_eq!(summary(controller.messages()), expected);
    assert!(controller.messages().iter().all(|m| !m.is_provisional()));

    let conversation = controller.active_conversation().unwrap().clone();
    assert_eq!(conversation.title, "Hello");
    let stored = store.list_messages(conversation.id).await.unwrap();
    assert_eq!(summary(&stored), expected);

    let view = controller.view();
    for (_, rendered) in &view.renders {
        assert!(rendered.iter().filter(|m| m.is_provisional()).count() <= 1);
    }
    let streamed: Vec<&str> = view
        .renders
        .iter()
        .filter_map(|(_, r)| r.last().filter(|m| m.is_provisional()))
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(streamed.last().copied(), Some("Hi there"));
    assert_eq!(view.loading, vec![true, false]);
    assert!(view.notices.is_empty());
    assert!(!controller.is_loading());
}

#[tokio::test]
async fn test_follow_up_sends_persisted_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_json(json!({
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": "Hi there"},
                {"role": "user", "content": "How are you?"}
            ],
            "mode": "formal"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body(&["Fine."]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_reply(&server, &["Hi", " there"]).await;

    let mut controller = ChatController::new(
        MemoryStore::new(),
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    controller.send_message("Hello").await.unwrap();
    controller.set_mode(ChatMode::Formal).await.unwrap();
    controller.send_message("How are you?").await.unwrap();

    assert_eq!(controller.messages().len(), 4);
    assert_eq!(controller.messages()[3].content, "Fine.");
    assert_eq!(controller.active_conversation().unwrap().mode, ChatMode::Formal);
    // Title comes from the first message only.
    assert_eq!(controller.active_conversation().unwrap().title, "Hello");
}

#[tokio::test]
async fn test_rate_limited_turn_saves_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let mut controller = ChatController::new(
        store.clone(),
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    let err = controller.send_message("Hello").await.unwrap_err();
    assert!(matches!(err, ChatError::RateLimited));

    let id = controller.active_conversation().unwrap().id;
    let stored = store.list_messages(id).await.unwrap();
    assert!(stored.iter().all(|m| m.role == Role::User));
    assert_eq!(controller.phase(), TurnPhase::Idle);
    assert!(!controller.is_loading());

    let view = controller.view();
    assert_eq!(view.loading.last(), Some(&false));
    assert_eq!(view.notices.len(), 1);
    assert_eq!(view.notices[0].title, "Rate Limit Exceeded");
}

#[tokio::test]
async fn test_payment_required_notice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(402))
        .mount(&server)
        .await;

    let mut controller = ChatController::new(
        MemoryStore::new(),
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    let err = controller.send_message("Hello").await.unwrap_err();
    assert!(matches!(err, ChatError::PaymentRequired));
    assert_eq!(controller.view().notices[0].title, "Payment Required");
    assert!(!controller.is_loading());
}

#[tokio::test]
async fn test_user_message_failure_blocks_the_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body(&["x"]), "text/event-stream"))
        .expect(0)
        .mount(&server)
        .await;

    let store = FlakyStore {
        inner: MemoryStore::new(),
        failing_role: Role::User,
    };
    let mut controller = ChatController::new(
        store,
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    let err = controller.send_message("Hello").await.unwrap_err();
    assert!(matches!(err, ChatError::Persistence(_)));
    assert!(controller.messages().is_empty());
    assert!(!controller.is_loading());
    assert_eq!(
        controller.view().notices,
        vec![Notice::new("Error", "Failed to save message")]
    );
}

#[tokio::test]
async fn test_assistant_save_failure_keeps_rendered_text() {
    let server = MockServer::start().await;
    mount_reply(&server, &["kept", " anyway"]).await;

    let store = FlakyStore {
        inner: MemoryStore::new(),
        failing_role: Role::Assistant,
    };
    let mut controller = ChatController::new(
        store,
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    controller.send_message("Hello").await.unwrap();

    let last = controller.messages().last().unwrap();
    assert!(last.is_provisional());
    assert_eq!(last.content, "kept anyway");
    assert!(controller.view().notices.is_empty());
    assert!(!controller.is_loading());
}

#[tokio::test]
async fn test_stale_turn_is_saved_but_not_rendered() {
    let server = MockServer::start().await;
    mount_reply(&server, &["Hi", " there"]).await;

    let store = MemoryStore::new();
    let mut controller = ChatController::new(
        store.clone(),
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    let first = controller.new_conversation().await.unwrap();
    let second = controller.new_conversation().await.unwrap();
    controller.select_conversation(first).await.unwrap();

    let turn = controller.submit("Hello").await.unwrap().unwrap();
    assert_eq!(turn.tag().conversation_id, first);
    controller.select_conversation(second).await.unwrap();
    let renders_before = controller.view().renders.len();
    controller.drive_turn(turn).await.unwrap();

    assert!(controller.messages().is_empty());
    assert_eq!(controller.view().renders.len(), renders_before);

    let saved = store.list_messages(first).await.unwrap();
    assert_eq!(
        summary(&saved),
        vec![(Role::User, "Hello"), (Role::Assistant, "Hi there")]
    );

    controller.select_conversation(first).await.unwrap();
    assert_eq!(summary(controller.messages()), summary(&saved));
}

#[tokio::test]
async fn test_pushed_rows_from_elsewhere_are_merged() {
    let server = MockServer::start().await;
    let store = MemoryStore::new();
    let mut controller = ChatController::new(
        store.clone(),
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    let id = controller.new_conversation().await.unwrap();

    // Another device writes to the same conversation.
    let row = store.insert_message(id, Role::User, "from phone").await.unwrap();
    controller.drain_pushes();
    controller.apply_push(row.clone());

    assert_eq!(controller.messages(), &[row]);
}

#[tokio::test]
async fn test_pushes_for_other_conversations_are_ignored() {
    let server = MockServer::start().await;
    let store = MemoryStore::new();
    let mut controller = ChatController::new(
        store.clone(),
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    let other = controller.new_conversation().await.unwrap();
    let active = controller.new_conversation().await.unwrap();
    assert_eq!(controller.active_conversation().unwrap().id, active);

    let row = store.insert_message(other, Role::User, "elsewhere").await.unwrap();
    let renders_before = controller.view().renders.len();
    controller.apply_push(row);

    assert!(controller.messages().is_empty());
    assert_eq!(controller.view().renders.len(), renders_before);
}

#[tokio::test]
async fn test_load_selects_newest_conversation_with_history() {
    let server = MockServer::start().await;
    let store = MemoryStore::new();
    let old = store.create_conversation("Old", ChatMode::Funny).await.unwrap();
    let recent = store
        .create_conversation("Recent", ChatMode::Motivator)
        .await
        .unwrap();
    store.insert_message(old.id, Role::User, "a").await.unwrap();
    store.insert_message(recent.id, Role::User, "b").await.unwrap();
    store
        .insert_message(recent.id, Role::Assistant, "c")
        .await
        .unwrap();

    let mut controller = ChatController::new(
        store,
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    controller.load_conversations().await.unwrap();

    assert_eq!(controller.conversations().len(), 2);
    assert_eq!(controller.active_conversation().unwrap().id, recent.id);
    assert_eq!(controller.mode(), ChatMode::Motivator);
    assert_eq!(
        summary(controller.messages()),
        vec![(Role::User, "b"), (Role::Assistant, "c")]
    );
}

#[tokio::test]
async fn test_long_first_message_is_truncated_into_title() {
    let server = MockServer::start().await;
    mount_reply(&server, &["ok"]).await;

    let mut controller = ChatController::new(
        MemoryStore::new(),
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    let text = "x".repeat(80);
    controller.send_message(&text).await.unwrap();

    let title = &controller.active_conversation().unwrap().title;
    assert_eq!(title, &format!("{}...", "x".repeat(50)));
    assert_eq!(controller.conversations()[0].title, *title);
}

#[tokio::test]
async fn test_blank_input_is_ignored() {
    let server = MockServer::start().await;
    let mut controller = ChatController::new(
        MemoryStore::new(),
        client_for(&server),
        RecordingView::default(),
        ChatMode::Friendly,
    );
    controller.send_message("   ").await.unwrap();
    assert!(controller.active_conversation().is_none());
    assert!(controller.view().loading.is_empty());
}

#[tokio::test]
async fn test_push_while_streaming_lands_before_the_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (first_sent_tx, first_sent_rx) = oneshot::channel();
    let (resume_tx, resume_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(data_line("Hi").as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        let _ = first_sent_tx.send(());

        let _ = resume_rx.await;
        socket.write_all(data_line(" there").as_bytes()).await.unwrap();
        socket.write_all(b"data: [DONE]\n\n").await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let store = MemoryStore::new();
    let view = RecordingView {
        waiter: Some(("from phone".to_string(), resume_tx)),
        ..RecordingView::default()
    };
    let client = ProxyClient::with_endpoint(format!("http://{addr}/chat"), Arc::new(Anonymous));
    let mut controller = ChatController::new(store.clone(), client, view, ChatMode::Friendly);
    let id = controller.new_conversation().await.unwrap();

    // Another device writes while the reply is mid-stream.
    let writer = store.clone();
    tokio::spawn(async move {
        if first_sent_rx.await.is_ok() {
            writer.insert_message(id, Role::User, "from phone").await.unwrap();
        }
    });

    tokio::time::timeout(Duration::from_secs(10), controller.send_message("Hello"))
        .await
        .expect("turn should finish")
        .unwrap();

    assert_eq!(
        summary(controller.messages()),
        vec![
            (Role::User, "Hello"),
            (Role::User, "from phone"),
            (Role::Assistant, "Hi there"),
        ]
    );
    assert!(controller.messages().iter().all(|m| !m.is_provisional()));

    let renders = &controller.view().renders;
    for (_, rendered) in renders {
        assert!(rendered.iter().filter(|m| m.is_provisional()).count() <= 1);
        assert!(rendered.iter().filter(|m| m.content == "from phone").count() <= 1);
    }
    let interleaved = renders.iter().any(|(_, rendered)| {
        rendered.len() == 3
            && rendered[1].content == "from phone"
            && rendered[2].is_provisional()
    });
    assert!(interleaved, "pushed row should be shown ahead of the streaming reply");

    controller.drain_pushes();
    assert_eq!(controller.messages().len(), 3);
}
