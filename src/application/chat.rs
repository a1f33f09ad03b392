use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::signal;
use yansi::Paint;

use super::context::AppContext;
use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::BackendBox;
use crate::domain::models::BackendName;
use crate::domain::models::ChatMessage;
use crate::domain::models::ChatState;
use crate::domain::models::Role;
use crate::domain::models::SendOptions;
use crate::domain::models::SlashCommand;
use crate::domain::services::observer::lock;
use crate::domain::services::BackendTitleGenerator;
use crate::domain::services::BridgeDeps;
use crate::domain::services::ChatBridge;
use crate::domain::services::ChatSessions;
use crate::domain::services::ChatViewStore;
use crate::domain::services::StreamingChatEngine;
use crate::domain::services::TitleService;
use crate::infrastructure::backends::BackendManager;

const PRINT_INTERVAL: Duration = Duration::from_millis(30);

pub fn help_text() -> String {
    let text = r#"
COMMANDS:
- /new (/n) - Starts a new chat. The current chat stays saved.
- /reset - Clears the current chat while keeping its session.
- /regenerate (/r) - Asks the backend to answer your last message again.
- /resume - Continues an exchange whose reply never arrived.
- /quit /exit (/q) - Exit feedchat.
- /help (/h) - Provides this help menu.

HOTKEYS:
- CTRL+C - Stops the reply in progress, otherwise exits.
        "#;

    return text.trim().to_string();
}

enum Exchange {
    Send(ChatMessage),
    Regenerate(String),
    Resume,
}

/// Prints the growing text of the reply being streamed. The assistant message
/// present before the exchange started is skipped.
struct ReplyPrinter {
    skip_id: Option<String>,
    cursor: Mutex<(Option<String>, usize)>,
}

impl ReplyPrinter {
    fn new(messages: &[ChatMessage]) -> ReplyPrinter {
        let skip_id = messages
            .last()
            .filter(|e| return e.role == Role::Assistant)
            .map(|e| return e.id.to_string());

        return ReplyPrinter {
            skip_id,
            cursor: Mutex::new((None, 0)),
        };
    }

    fn print(&self, messages: &[ChatMessage]) {
        let Some(last) = messages.last() else {
            return;
        };
        if last.role != Role::Assistant || self.skip_id.as_deref() == Some(last.id.as_str()) {
            return;
        }

        let mut cursor = lock(&self.cursor);
        if cursor.0.as_deref() != Some(last.id.as_str()) {
            *cursor = (Some(last.id.to_string()), 0);
            print!("{} ", Paint::green(Config::get(ConfigKey::Model)).bold());
        }

        let text = last.text();
        if let Some(delta) = text.get(cursor.1..) {
            print!("{delta}");
            cursor.1 = text.len();
        }
        let _ = std::io::stdout().flush();
    }

    fn finish(&self) {
        let cursor = lock(&self.cursor);
        if cursor.0.is_some() {
            println!();
        }
    }
}

async fn connect_backend() -> Result<(Arc<BackendBox>, String)> {
    let backend_name = Config::get(ConfigKey::Backend);
    let Some(name) = BackendName::parse(backend_name.to_string()) else {
        bail!(format!("Unknown backend {backend_name}"));
    };

    let backend = BackendManager::get(name)?;
    backend.health_check().await?;

    let mut model = Config::get(ConfigKey::Model);
    if model.is_empty() {
        let models = backend.list_models().await?;
        let Some(first) = models.first() else {
            bail!(format!("Backend {name} has no models available"));
        };
        model = first.to_string();
        Config::set(ConfigKey::Model, &model);
    }

    tracing::info!(backend = %name, model = %model, "Backend connected");
    return Ok((Arc::new(backend), model));
}

fn print_message(message: &ChatMessage) {
    match message.role {
        Role::User => println!("{} {}", Paint::cyan("you").bold(), message.text()),
        Role::Assistant => println!("{} {}", Paint::green("assistant").bold(), message.text()),
    }
}

fn prompt() {
    print!("{} ", Paint::cyan(">").bold());
    let _ = std::io::stdout().flush();
}

async fn run_exchange(bridge: &ChatBridge, exchange: Exchange) -> Result<()> {
    match exchange {
        Exchange::Send(message) => return bridge.send_message(message, SendOptions::default()).await,
        Exchange::Regenerate(message_id) => return bridge.regenerate(&message_id).await,
        Exchange::Resume => return bridge.resume_stream().await,
    }
}

async fn stream_exchange(sessions: &ChatSessions, exchange: Exchange) {
    let bridge = sessions.active();
    let printer = Arc::new(ReplyPrinter::new(&bridge.messages()));
    let listener_printer = printer.clone();
    let subscription = bridge.on_messages_change(
        Arc::new(move |messages: &Vec<ChatMessage>| {
            listener_printer.print(messages);
        }),
        Some(PRINT_INTERVAL),
    );

    let running = run_exchange(&bridge, exchange);
    tokio::pin!(running);
    let res = tokio::select! {
        res = &mut running => res,
        _ = signal::ctrl_c() => {
            bridge.stop();
            (&mut running).await
        }
    };

    subscription.unsubscribe();
    printer.print(&bridge.messages());
    printer.finish();

    if let Err(err) = res {
        eprintln!("{}", Paint::red(format!("Error: {err:#}")));
    }

    if let Err(err) = sessions.persist_active().await {
        tracing::error!(chat_id = bridge.chat_id(), error = ?err, "Failed to persist chat");
        eprintln!("{}", Paint::red(format!("Failed to save chat: {err:#}")));
    }
}

async fn open_session(ctx: &AppContext, sessions: &ChatSessions, chat_id: &str) -> Result<()> {
    if let Some(sync) = &ctx.sync {
        sync.sync_session_messages(chat_id).await?;
        if let Err(err) = sync.mark_session_seen(chat_id).await {
            tracing::warn!(chat_id, error = ?err, "Failed to mark session seen");
        }
    }

    let bridge = sessions.open_chat(chat_id).await?;
    let view = sessions.view().get();
    if let Some(title) = view.title {
        println!("{}\n", Paint::new(title).underline().bold());
    }
    for message in bridge.messages().iter() {
        print_message(message);
    }

    return Ok(());
}

/// Line based chat loop on stdin. Returns once the user quits or stdin closes.
pub async fn start(ctx: AppContext) -> Result<()> {
    let (backend, model) = connect_backend().await?;

    let titles = Arc::new(TitleService::new(
        Arc::new(BackendTitleGenerator::new(backend.clone(), &model)),
        ctx.store(),
        ctx.remote(),
    ));
    let deps = BridgeDeps {
        engine: Arc::new(StreamingChatEngine::new(backend, &model)),
        titles,
        view: ChatViewStore::default(),
    };
    let sessions = ChatSessions::new(deps, ctx.store());

    if let Some(sync) = &ctx.sync {
        sync.load_sessions_from_db().await?;
    }

    let session_id = Config::get(ConfigKey::SessionID);
    if !session_id.is_empty() {
        open_session(&ctx, &sessions, &session_id).await?;
    }

    println!(
        "{}",
        Paint::new(format!(
            "Chatting with {model} as session {}. Type /help for commands.",
            sessions.active().chat_id()
        ))
        .dimmed()
    );

    let mut view = sessions.view().subscribe();
    let mut shown_title = view.borrow_and_update().title.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();

        let line = loop {
            tokio::select! {
                line = lines.next_line() => break line?,
                _ = signal::ctrl_c() => break None,
                Ok(()) = view.changed() => {
                    let title = view.borrow_and_update().title.clone();
                    if title != shown_title {
                        if let Some(text) = &title {
                            println!("\n{}", Paint::new(format!("Session titled: {text}")).dimmed());
                            prompt();
                        }
                    }
                    shown_title = title;
                }
            }
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let Some(cmd) = SlashCommand::parse(text) else {
            stream_exchange(&sessions, Exchange::Send(ChatMessage::new(Role::User, text))).await;
            continue;
        };

        if cmd.is_quit() {
            break;
        }

        if cmd.is_help() {
            println!("{}", help_text());
            continue;
        }

        if cmd.is_new_chat() {
            sessions.active().wait_for_title().await;
            let bridge = sessions.new_chat();
            println!("{}", Paint::new(format!("Started chat {}", bridge.chat_id())).dimmed());
            continue;
        }

        if cmd.is_reset_chat() {
            sessions.active().reset_chat();
            println!("{}", Paint::new("Chat cleared").dimmed());
            continue;
        }

        if cmd.is_regenerate() {
            let last_assistant = sessions
                .active()
                .messages()
                .iter()
                .rev()
                .find(|e| return e.role == Role::Assistant)
                .map(|e| return e.id.to_string());

            match last_assistant {
                Some(message_id) => stream_exchange(&sessions, Exchange::Regenerate(message_id)).await,
                None => println!("There is no reply to regenerate yet."),
            }
            continue;
        }

        if cmd.is_resume() {
            stream_exchange(&sessions, Exchange::Resume).await;
        }
    }

    sessions.active().wait_for_title().await;
    return Ok(());
}
