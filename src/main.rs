use chatfren::ai::ProxyClient;
use chatfren::auth::{Anonymous, StaticToken, TokenProvider};
use chatfren::chat::{ChatController, ChatView, Notice};
use chatfren::config::{ChatConfig, parse_env_file};
use chatfren::store::{ChatStore, MemoryStore};
use chatfren::types::{ChatMode, Conversation, ConversationId, Message, MessageId, MessageKey, Role};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::ops::ControlFlow;
use std::sync::Arc;
use time::{OffsetDateTime, UtcOffset, format_description::FormatItem, macros::format_description};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Bundled defaults, used when neither `.env` nor the environment set a key
const BUNDLED_CONFIG: &str = include_str!("../assets/config.env");

const MESSAGE_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[hour repr:12 padding:zero]:[minute padding:zero] [period case:upper]");

fn load_dotenv() -> HashMap<String, String> {
    // A missing .env is normal outside local development.
    let _ = dotenvy::dotenv();
    parse_env_file(BUNDLED_CONFIG)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatfren=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn format_message_timestamp(timestamp: OffsetDateTime) -> Option<String> {
    let mut datetime = timestamp;
    if let Ok(offset) = UtcOffset::current_local_offset() {
        datetime = datetime.to_offset(offset);
    }
    datetime.format(MESSAGE_TIME_FORMAT).ok()
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "chatfren",
    }
}

/// Reply text already written for the provisional tail.
struct Streaming {
    local_seq: u64,
    text: String,
}

/// Prints the transcript, streaming the provisional reply in place.
///
/// Rows are tracked by id, so a row merged in ahead of the streaming reply
/// ends the partial line and the reply is reprinted below it.
struct TerminalView<W> {
    out: W,
    conversation: Option<ConversationId>,
    shown: HashSet<MessageId>,
    streaming: Option<Streaming>,
}

impl TerminalView<std::io::Stdout> {
    fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> TerminalView<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            conversation: None,
            shown: HashSet::new(),
            streaming: None,
        }
    }

    fn draw(&mut self, conversation: &Conversation, messages: &[Message]) -> std::io::Result<()> {
        if self.conversation != Some(conversation.id) {
            self.end_partial_line()?;
            self.conversation = Some(conversation.id);
            self.shown.clear();
            writeln!(self.out, "== {} [{}]", conversation.title, conversation.mode.label())?;
        }

        let last = messages.len().saturating_sub(1);
        for (index, message) in messages.iter().enumerate() {
            match message.key {
                MessageKey::Persisted { id } => {
                    if !self.shown.insert(id) {
                        continue;
                    }
                    let continues_reply = index == last
                        && message.role == Role::Assistant
                        && self
                            .streaming
                            .as_ref()
                            .is_some_and(|s| message.content.starts_with(&s.text));
                    match self.streaming.take() {
                        Some(streamed) if continues_reply => {
                            let rest = message.content.get(streamed.text.len()..).unwrap_or_default();
                            write!(self.out, "{rest}")?;
                        }
                        Some(_) => {
                            writeln!(self.out)?;
                            write!(self.out, "{}: {}", speaker(message.role), message.content)?;
                        }
                        None => write!(self.out, "{}: {}", speaker(message.role), message.content)?,
                    }
                    self.finish_line(message)?;
                }
                MessageKey::Provisional { local_seq } => {
                    let extends = self.streaming.as_ref().is_some_and(|s| {
                        s.local_seq == local_seq && message.content.starts_with(&s.text)
                    });
                    if extends {
                        if let Some(streamed) = self.streaming.as_mut() {
                            let rest = message.content.get(streamed.text.len()..).unwrap_or_default();
                            write!(self.out, "{rest}")?;
                            streamed.text.clone_from(&message.content);
                        }
                    } else {
                        self.end_partial_line()?;
                        write!(self.out, "{}: {}", speaker(message.role), message.content)?;
                        self.streaming = Some(Streaming {
                            local_seq,
                            text: message.content.clone(),
                        });
                    }
                }
            }
        }
        self.out.flush()
    }

    fn end_partial_line(&mut self) -> std::io::Result<()> {
        if self.streaming.take().is_some() {
            writeln!(self.out)?;
        }
        Ok(())
    }

    fn finish_line(&mut self, message: &Message) -> std::io::Result<()> {
        match format_message_timestamp(message.created_at) {
            Some(stamp) => writeln!(self.out, "  ({stamp})"),
            None => writeln!(self.out),
        }
    }
}

impl<W: Write> ChatView for TerminalView<W> {
    fn render(&mut self, conversation: &Conversation, messages: &[Message]) {
        if let Err(err) = self.draw(conversation, messages) {
            tracing::debug!(error = %err, "failed to write transcript");
        }
    }

    fn set_loading(&mut self, loading: bool) {
        tracing::debug!(loading, "loading state changed");
    }

    fn notify(&mut self, notice: Notice) {
        let _ = self.end_partial_line().and_then(|()| self.out.flush());
        eprintln!("[{}] {}", notice.title, notice.description);
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Send(String),
    New,
    List,
    Open(usize),
    Mode(String),
    Modes,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Command {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Send(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "new" => Command::New,
            "list" => Command::List,
            "open" => arg
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .map_or_else(|| Command::Unknown(line.to_string()), Command::Open),
            "mode" if !arg.is_empty() => Command::Mode(arg.to_string()),
            "modes" => Command::Modes,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

fn print_help() {
    println!("Type a message to chat. Commands:");
    println!("  /new          start a new chat");
    println!("  /list         list chats");
    println!("  /open <n>     open chat number n from /list");
    println!("  /mode <id>    switch persona (see /modes)");
    println!("  /quit         exit");
}

async fn run(config: ChatConfig) -> anyhow::Result<()> {
    let tokens: Arc<dyn TokenProvider> = match &config.access_token {
        Some(token) => Arc::new(StaticToken::new(token.clone())),
        None => Arc::new(Anonymous),
    };
    let client = ProxyClient::new(&config, tokens);
    tracing::info!(endpoint = client.endpoint(), mode = %config.default_mode, "chatfren ready");

    let mut controller = ChatController::new(
        MemoryStore::new(),
        client,
        TerminalView::stdout(),
        config.default_mode,
    );
    controller.load_conversations().await?;
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        controller.drain_pushes();
        if handle(&mut controller, Command::parse(&line)).await.is_break() {
            break;
        }
    }
    Ok(())
}

/// Run one command. Failures are reported and the loop keeps going.
async fn handle<S, V>(controller: &mut ChatController<S, V>, command: Command) -> ControlFlow<()>
where
    S: ChatStore,
    V: ChatView,
{
    match command {
        Command::Send(text) => {
            if let Err(err) = controller.send_message(&text).await {
                tracing::debug!(error = %err, "turn ended with an error");
            }
        }
        Command::New => {
            if let Err(err) = controller.new_conversation().await {
                tracing::debug!(error = %err, "could not start a chat");
            }
        }
        Command::List => {
            let active = controller.active_conversation().map(|c| c.id);
            for (index, conversation) in controller.conversations().iter().enumerate() {
                let marker = if Some(conversation.id) == active { "*" } else { " " };
                println!(
                    "{marker} {}. {} [{}]",
                    index + 1,
                    conversation.title,
                    conversation.mode
                );
            }
        }
        Command::Open(number) => {
            let Some(id) = controller.conversations().get(number - 1).map(|c| c.id) else {
                eprintln!("no chat number {number}");
                return ControlFlow::Continue(());
            };
            if let Err(err) = controller.select_conversation(id).await {
                eprintln!("could not open chat: {err}");
            }
        }
        Command::Mode(raw) => match raw.parse::<ChatMode>() {
            Ok(mode) => {
                if let Err(err) = controller.set_mode(mode).await {
                    tracing::warn!(error = %err, "could not refresh chats after mode change");
                }
                println!("mode: {}", controller.mode().label());
            }
            Err(err) => eprintln!("{err}"),
        },
        Command::Modes => {
            for mode in ChatMode::ALL {
                println!("  {:<11} {}", mode.as_str(), mode.label());
            }
        }
        Command::Help => print_help(),
        Command::Quit => return ControlFlow::Break(()),
        Command::Unknown(raw) => eprintln!("unknown command: {raw}"),
    }
    ControlFlow::Continue(())
}

fn main() -> anyhow::Result<()> {
    let bundled = load_dotenv();
    init_tracing();
    let config = ChatConfig::from_lookup(|key| {
        std::env::var(key)
            .ok()
            .or_else(|| bundled.get(key).cloned())
    })?;

    // One thread: every callback and push is applied in turn.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}
