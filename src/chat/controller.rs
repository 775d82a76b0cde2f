use super::reconcile::MessageList;
use super::view::{ChatView, Notice};
use crate::ai::{ChatError, ChatResult, DeltaAggregator, ProxyClient, TurnEvent, TurnEvents};
use crate::store::{ChatStore, Subscription};
use crate::types::{
    ChatMode, Conversation, ConversationId, Message, NEW_CHAT_TITLE, Role, derive_title,
};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TurnPhase {
    #[default]
    Idle,
    /// User message is being saved.
    Sending,
    /// Fragments are arriving.
    Streaming,
    /// Assistant reply is being saved.
    Finalizing,
}

/// Identifies which conversation an in-flight turn writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnTag {
    pub conversation_id: ConversationId,
    pub seq: u64,
}

/// A reply being streamed for one submitted user message.
pub struct PendingTurn {
    tag: TurnTag,
    events: TurnEvents,
    aggregator: DeltaAggregator,
    failure: Option<ChatError>,
}

impl PendingTurn {
    pub fn tag(&self) -> TurnTag {
        self.tag
    }

    pub fn content(&self) -> &str {
        self.aggregator.snapshot()
    }
}

struct ActiveConversation {
    conversation: Conversation,
    messages: MessageList,
    subscription: Subscription,
}

/// Single owner of the client-side chat state.
///
/// All mutation of the visible message list goes through this type, one
/// event at a time.
pub struct ChatController<S, V> {
    store: S,
    client: ProxyClient,
    view: V,
    conversations: Vec<Conversation>,
    active: Option<ActiveConversation>,
    mode: ChatMode,
    phase: TurnPhase,
    turn_seq: u64,
}

impl<S, V> ChatController<S, V>
where
    S: ChatStore,
    V: ChatView,
{
    pub fn new(store: S, client: ProxyClient, view: V, mode: ChatMode) -> Self {
        Self {
            store,
            client,
            view,
            conversations: Vec::new(),
            active: None,
            mode,
            phase: TurnPhase::Idle,
            turn_seq: 0,
        }
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase != TurnPhase::Idle
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().map(|a| &a.conversation)
    }

    pub fn messages(&self) -> &[Message] {
        self.active
            .as_ref()
            .map(|a| a.messages.messages())
            .unwrap_or(&[])
    }

    // ============================================
    // Conversation lifecycle
    // ============================================

    /// Refresh the conversation list, selecting the newest one when nothing
    /// is selected yet.
    pub async fn load_conversations(&mut self) -> ChatResult<()> {
        self.refresh_conversations().await?;
        if self.active.is_none() {
            if let Some(first) = self.conversations.first().map(|c| c.id) {
                self.select_conversation(first).await?;
            }
        }
        Ok(())
    }

    pub async fn new_conversation(&mut self) -> ChatResult<ConversationId> {
        let conversation = match self.store.create_conversation(NEW_CHAT_TITLE, self.mode).await {
            Ok(conversation) => conversation,
            Err(err) => {
                tracing::warn!(error = %err, "failed to create conversation");
                self.view.notify(Notice::new("Error", "Failed to create new chat"));
                return Err(err.into());
            }
        };
        let id = conversation.id;
        self.refresh_conversations().await?;
        self.select_conversation(id).await?;
        Ok(id)
    }

    /// Make `id` the visible conversation.
    ///
    /// The push subscription is opened before the history is loaded; merges
    /// are idempotent, so rows landing in between show up once.
    pub async fn select_conversation(&mut self, id: ConversationId) -> ChatResult<()> {
        let conversation = self.store.get_conversation(id).await?;
        let subscription = self.store.subscribe(id).await?;
        let rows = match self.store.list_messages(id).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, %id, "failed to load messages");
                return Err(err.into());
            }
        };

        tracing::debug!(%id, messages = rows.len(), "conversation selected");
        self.mode = conversation.mode;
        self.active = Some(ActiveConversation {
            conversation,
            messages: MessageList::from_persisted(rows),
            subscription,
        });
        self.render();
        Ok(())
    }

    pub async fn set_mode(&mut self, mode: ChatMode) -> ChatResult<()> {
        self.mode = mode;
        let Some(id) = self.active.as_ref().map(|a| a.conversation.id) else {
            return Ok(());
        };
        if let Err(err) = self.store.set_conversation_mode(id, mode).await {
            tracing::warn!(error = %err, %id, "failed to store chat mode");
            return Ok(());
        }
        if let Some(active) = self.active.as_mut() {
            active.conversation.mode = mode;
        }
        self.refresh_conversations().await
    }

    // ============================================
    // Turns
    // ============================================

    /// Send a user message and stream the reply to completion.
    pub async fn send_message(&mut self, text: &str) -> ChatResult<()> {
        match self.submit(text).await? {
            Some(turn) => self.drive_turn(turn).await,
            None => Ok(()),
        }
    }

    /// Save the user message and open the reply stream.
    ///
    /// Returns `None` when there is nothing to send or a turn is already in
    /// flight.
    pub async fn submit(&mut self, text: &str) -> ChatResult<Option<PendingTurn>> {
        let content = text.trim();
        if content.is_empty() || self.is_loading() {
            return Ok(None);
        }
        if self.active.is_none() {
            self.new_conversation().await?;
        }
        let Some(conversation_id) = self.active.as_ref().map(|a| a.conversation.id) else {
            return Ok(None);
        };

        self.set_phase(TurnPhase::Sending);
        let saved = match self
            .store
            .insert_message(conversation_id, Role::User, content)
            .await
        {
            Ok(saved) => saved,
            Err(err) => {
                tracing::warn!(error = %err, %conversation_id, "failed to save user message");
                let err = ChatError::from(err);
                self.view.notify(err.notice());
                self.set_phase(TurnPhase::Idle);
                return Err(err);
            }
        };

        let history = match self.active.as_mut() {
            Some(active) => {
                active.messages.discard_provisional();
                active.messages.merge_persisted(saved);
                active.messages.persisted_history()
            }
            None => Vec::new(),
        };
        self.render();
        self.retitle(conversation_id, content).await;

        self.turn_seq += 1;
        let tag = TurnTag {
            conversation_id,
            seq: self.turn_seq,
        };
        tracing::debug!(%conversation_id, seq = tag.seq, mode = %self.mode, "starting turn");
        let events = self.client.spawn_turn(history, self.mode);
        Ok(Some(PendingTurn {
            tag,
            events,
            aggregator: DeltaAggregator::new(),
            failure: None,
        }))
    }

    /// Apply turn events and pushed rows, in arrival order, until the turn
    /// is done.
    pub async fn drive_turn(&mut self, mut turn: PendingTurn) -> ChatResult<()> {
        loop {
            tokio::select! {
                event = turn.events.recv() => {
                    let event = event.unwrap_or(TurnEvent::Done);
                    if self.apply_turn_event(&mut turn, event).await {
                        break;
                    }
                }
                Some(row) = next_push(&mut self.active) => {
                    self.apply_push(row);
                }
            }
        }
        match turn.failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Merge a row delivered by the live-update channel.
    pub fn apply_push(&mut self, row: Message) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.subscription.conversation_id() != row.conversation_id {
            tracing::trace!(conversation_id = %row.conversation_id, "push for another conversation ignored");
            return;
        }
        let outcome = active.messages.merge_persisted(row);
        tracing::trace!(?outcome, "pushed message merged");
        self.render();
    }

    /// Merge any rows already waiting on the live-update channel.
    pub fn drain_pushes(&mut self) {
        while let Some(row) = self.active.as_mut().and_then(|a| a.subscription.try_recv()) {
            self.apply_push(row);
        }
    }

    /// Returns true once the turn has ended.
    async fn apply_turn_event(&mut self, turn: &mut PendingTurn, event: TurnEvent) -> bool {
        match event {
            TurnEvent::Fragment(piece) => {
                let snapshot = turn.aggregator.append(&piece);
                self.phase = TurnPhase::Streaming;
                match self.current_for(turn.tag) {
                    Some(active) => {
                        active.messages.upsert_provisional(
                            turn.tag.conversation_id,
                            snapshot,
                            OffsetDateTime::now_utc(),
                        );
                        self.render();
                    }
                    None => tracing::trace!(seq = turn.tag.seq, "fragment for stale turn not rendered"),
                }
                false
            }
            TurnEvent::Failed(err) => {
                self.view.notify(err.notice());
                turn.failure = Some(err);
                false
            }
            TurnEvent::Done => {
                if turn.failure.is_none() && !turn.aggregator.is_empty() {
                    self.set_phase(TurnPhase::Finalizing);
                    self.persist_reply(turn).await;
                }
                self.set_phase(TurnPhase::Idle);
                true
            }
        }
    }

    async fn persist_reply(&mut self, turn: &PendingTurn) {
        let conversation_id = turn.tag.conversation_id;
        let saved = match self
            .store
            .insert_message(conversation_id, Role::Assistant, turn.content())
            .await
        {
            Ok(saved) => saved,
            Err(err) => {
                tracing::warn!(error = %err, %conversation_id, "failed to save assistant reply");
                return;
            }
        };
        if let Some(active) = self.current_for(turn.tag) {
            let outcome = active.messages.finalize_provisional(saved);
            tracing::trace!(?outcome, "assistant reply reconciled");
            self.render();
        }
    }

    // ============================================
    // Helpers
    // ============================================

    async fn retitle(&mut self, id: ConversationId, first_message: &str) {
        let needs_title = self
            .active
            .as_ref()
            .is_some_and(|a| a.conversation.id == id && a.conversation.has_default_title());
        if !needs_title {
            return;
        }
        let title = derive_title(first_message);
        if let Err(err) = self.store.rename_conversation(id, &title).await {
            tracing::warn!(error = %err, %id, "failed to rename conversation");
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.conversation.title = title;
        }
        if let Err(err) = self.refresh_conversations().await {
            tracing::warn!(error = %err, "failed to refresh conversations");
        }
    }

    async fn refresh_conversations(&mut self) -> ChatResult<()> {
        self.conversations = self.store.list_conversations().await?;
        self.view.conversations_changed(&self.conversations);
        Ok(())
    }

    /// Active state, but only while the turn's conversation is still the
    /// selected one.
    fn current_for(&mut self, tag: TurnTag) -> Option<&mut ActiveConversation> {
        self.active
            .as_mut()
            .filter(|a| a.conversation.id == tag.conversation_id)
    }

    fn set_phase(&mut self, phase: TurnPhase) {
        let was_loading = self.is_loading();
        self.phase = phase;
        let loading = self.is_loading();
        if was_loading != loading {
            self.view.set_loading(loading);
        }
    }

    fn render(&mut self) {
        if let Some(active) = self.active.as_ref() {
            self.view
                .render(&active.conversation, active.messages.messages());
        }
    }
}

async fn next_push(active: &mut Option<ActiveConversation>) -> Option<Message> {
    match active.as_mut() {
        Some(active) => match active.subscription.recv().await {
            Some(row) => Some(row),
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
