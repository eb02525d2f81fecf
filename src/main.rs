//! `localchat`: line-oriented chat client for a local generation backend.
//!
//! Reads lines from stdin. Lines starting with `/` are commands; anything else
//! is sent to the current session and the reply streams to stdout. Ctrl-C
//! while a reply is streaming stops the generation.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use localchat::chat_core::{
    ChatError, ChatService, GenerationOutcome, HeuristicTokenCounter, SessionManager,
    SqliteSessionStore,
};
use localchat::config::AppConfig;
use localchat::inference::InferenceClient;

const HELP: &str = "\
Commands:
  /new [model]     start a new session (optionally with a model)
  /sessions        list sessions, most recent first
  /switch <id>     make a session current
  /delete <id>     delete a session and its messages
  /models          list models installed on the backend
  /stats           token usage for the current session and per model
  /help            show this help
  /quit            exit
Anything else is sent to the current session. Ctrl-C stops a streaming reply.";

// ─── Commands ────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    New(Option<&'a str>),
    Sessions,
    Switch(&'a str),
    Delete(&'a str),
    Models,
    Stats,
    Help,
    Quit,
    Send(&'a str),
    Invalid(String),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Send(line);
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
            None => (rest, None),
        };

        match (name, arg) {
            ("new", model) => Command::New(model),
            ("sessions", None) => Command::Sessions,
            ("switch", Some(id)) => Command::Switch(id),
            ("delete", Some(id)) => Command::Delete(id),
            ("models", None) => Command::Models,
            ("stats", None) => Command::Stats,
            ("help", None) => Command::Help,
            ("quit" | "exit", None) => Command::Quit,
            ("switch" | "delete", None) => Command::Invalid(format!("usage: /{name} <id>")),
            _ => Command::Invalid(format!("unknown command '/{name}', try /help")),
        }
    }
}

// ─── App ─────────────────────────────────────────────────────────────────────

struct App {
    service: ChatService,
    client: Arc<InferenceClient>,
    store: Arc<SqliteSessionStore>,
}

impl App {
    async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let db_path = localchat::resolve_db_path(config).context("failed to prepare data dir")?;
        let store = Arc::new(
            SqliteSessionStore::open(&db_path)
                .with_context(|| format!("failed to open database at {db_path}"))?,
        );
        let client = Arc::new(
            InferenceClient::new(&config.backend).context("failed to build inference client")?,
        );
        let manager = SessionManager::load(
            store.clone(),
            Arc::new(HeuristicTokenCounter),
            config.context.clone(),
            config.backend.default_model.clone(),
        )
        .await
        .context("failed to load sessions")?;

        Ok(Self {
            service: ChatService::new(manager, client.clone()),
            client,
            store,
        })
    }

    /// Run one command. Returns `false` when the app should exit.
    async fn handle(&self, command: Command<'_>) -> anyhow::Result<bool> {
        match command {
            Command::Quit => return Ok(false),
            Command::Help => println!("{HELP}"),
            Command::Invalid(message) => println!("{message}"),
            Command::New(model) => {
                let session = self.service.create_session(model).await?;
                println!("new session {} ({})", session.id, session.model);
            }
            Command::Sessions => self.print_sessions().await,
            Command::Switch(id) => match self.service.switch_session(id).await {
                Some(session) => println!("switched to {} {}", session.id, session.name),
                None => println!("no session with id '{id}'"),
            },
            Command::Delete(id) => match self.service.delete_session(id).await {
                Ok(()) => println!("deleted {id}"),
                Err(e) => println!("{}", e.user_message()),
            },
            Command::Models => match self.client.list_models().await {
                Ok(models) if models.is_empty() => println!("no models installed"),
                Ok(models) => {
                    for model in models {
                        let size = model.size as f64 / 1e9;
                        println!("  {:<32} {size:>6.1} GB", model.name);
                    }
                }
                Err(e) => println!("could not list models: {e}"),
            },
            Command::Stats => match self.stats_report().await {
                Ok(lines) => lines.iter().for_each(|line| println!("{line}")),
                Err(e) => println!("{}", e.user_message()),
            },
            Command::Send(text) if text.is_empty() => {}
            Command::Send(text) => self.send(text).await,
        }
        Ok(true)
    }

    async fn print_sessions(&self) {
        let manager = self.service.manager().await;
        let current = manager.current_session_id().map(str::to_string);
        let sessions = manager.sessions();
        if sessions.is_empty() {
            println!("no sessions yet, use /new");
            return;
        }
        for session in sessions {
            let marker = if current.as_deref() == Some(session.id.as_str()) { "*" } else { " " };
            let name = if session.name.is_empty() { "(unnamed)" } else { session.name.as_str() };
            println!(
                "{marker} {}  {:<40} {:<20} {:>6} tokens",
                session.id, name, session.model, session.total_tokens
            );
        }
    }

    async fn stats_report(&self) -> Result<Vec<String>, ChatError> {
        let mut lines = Vec::new();
        let current = self
            .service
            .manager()
            .await
            .current_session_id()
            .map(str::to_string);
        if let Some(id) = current {
            let stats = self.store.session_stats(&id)?;
            lines.push(format!(
                "session: {} messages, {} tokens ({} user / {} assistant), {}s",
                stats.message_count,
                stats.total_tokens,
                stats.user_tokens,
                stats.assistant_tokens,
                stats.duration_secs
            ));
        }
        for usage in self.store.token_usage_by_model()? {
            lines.push(format!("  {:<32} {:>8} tokens", usage.model, usage.tokens));
        }
        Ok(lines)
    }

    /// Send a line and stream the reply, stopping it on Ctrl-C.
    async fn send(&self, text: &str) {
        let generation = self.service.send_message_with(text, None, |fragment| {
            print!("{fragment}");
            let _ = std::io::stdout().flush();
        });
        tokio::pin!(generation);

        let result = loop {
            tokio::select! {
                result = &mut generation => break result,
                _ = tokio::signal::ctrl_c() => {
                    self.service.stop_generation().await;
                }
            }
        };
        println!();

        match result {
            Ok(GenerationOutcome::Cancelled { .. }) => println!("[stopped]"),
            Ok(GenerationOutcome::Completed { .. }) => {}
            Err(e) => println!("error: {}", e.user_message()),
        }
    }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_path = localchat::init_tracing().context("failed to initialize logging")?;
    let config = AppConfig::load().context("failed to load configuration")?;
    let app = App::build(&config).await?;

    if !app.client.is_responding().await {
        println!(
            "warning: no backend answering at {}, is it running?",
            app.client.base_url()
        );
    }
    println!("localchat {} (log: {})", env!("CARGO_PKG_VERSION"), log_path.display());
    println!("type /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        {
            let manager = app.service.manager().await;
            let label = manager
                .current_session()
                .map(|s| if s.name.is_empty() { "new chat" } else { s.name.as_str() })
                .unwrap_or("no session");
            print!("[{label}] > ");
        }
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if !app.handle(Command::parse(&line)).await? {
            break;
        }
    }

    tracing::info!("=== LocalChat exiting ===");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text_is_send() {
        assert_eq!(Command::parse("  hello there "), Command::Send("hello there"));
    }

    #[test]
    fn test_parse_new_with_and_without_model() {
        assert_eq!(Command::parse("/new"), Command::New(None));
        assert_eq!(Command::parse("/new llama3:8b"), Command::New(Some("llama3:8b")));
    }

    #[test]
    fn test_parse_switch_requires_id() {
        assert_eq!(Command::parse("/switch abc"), Command::Switch("abc"));
        assert!(matches!(Command::parse("/switch"), Command::Invalid(_)));
    }

    #[test]
    fn test_parse_unknown_command() {
        match Command::parse("/frobnicate") {
            Command::Invalid(message) => assert!(message.contains("frobnicate")),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_quit_aliases() {
        assert_eq!(Command::parse("/quit"), Command::Quit);
        assert_eq!(Command::parse("/exit"), Command::Quit);
    }

    async fn test_app(db_path: &str) -> App {
        let store = Arc::new(SqliteSessionStore::open(db_path).unwrap());
        let client = Arc::new(InferenceClient::new(&Default::default()).unwrap());
        let manager = SessionManager::load(
            store.clone(),
            Arc::new(HeuristicTokenCounter),
            Default::default(),
            "test-model",
        )
        .await
        .unwrap();
        App {
            service: ChatService::new(manager, client.clone()),
            client,
            store,
        }
    }

    #[tokio::test]
    async fn test_stats_storage_error_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("chat.db").to_string_lossy().into_owned();
        let app = test_app(&db_path).await;
        assert!(app.handle(Command::New(None)).await.unwrap());
        assert_eq!(app.stats_report().await.unwrap().len(), 1);

        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch("DROP TABLE messages")
            .unwrap();

        assert!(matches!(
            app.stats_report().await,
            Err(ChatError::StorageError { .. })
        ));
        assert!(app.handle(Command::Stats).await.unwrap());
    }
}
