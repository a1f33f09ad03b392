use std::io;
use std::path;

use anyhow::bail;
use anyhow::Result;
use clap::builder::PossibleValuesParser;
use clap::value_parser;
use clap::Arg;
use clap::ArgAction;
use clap::ArgMatches;
use clap::Command;
use clap_complete::generate;
use clap_complete::Generator;
use clap_complete::Shell;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Select;
use strum::VariantNames;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use yansi::Paint;

use super::chat::help_text;
use super::context::AppContext;
use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::BackendName;
use crate::domain::models::ChatMessage;
use crate::domain::models::ChatSession;
use crate::domain::models::ChatStore;
use crate::domain::models::SessionFilters;

fn print_completions<G: Generator>(gen: G, cmd: &mut Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
    std::process::exit(0);
}

fn format_session(session: &ChatSession) -> String {
    let mut title = session
        .title
        .clone()
        .unwrap_or_else(|| return "Untitled".to_string());
    if title.chars().count() >= 70 {
        title = format!("{}...", title.chars().take(67).collect::<String>());
    }

    return format!(
        "- (ID: {}) {}, {}, {}",
        session.chat_id,
        session.updated_at.to_rfc3339(),
        session.sync_status,
        title
    );
}

fn format_message(message: &ChatMessage) -> String {
    return format!(
        "[{}] {}: {}",
        message.created_at.to_rfc3339(),
        message.role,
        message.text()
    );
}

fn print_sessions(sessions: &[ChatSession]) {
    if sessions.is_empty() {
        println!("There are no sessions available. You should start your first one!");
        return;
    }

    let lines = sessions
        .iter()
        .map(|session| {
            return format_session(session);
        })
        .collect::<Vec<String>>();
    println!("{}", lines.join("\n"));
}

async fn create_config_file() -> Result<()> {
    let config_file_path_str = Config::default(ConfigKey::ConfigFile);
    let config_file_path = path::PathBuf::from(&config_file_path_str);
    if config_file_path.exists() {
        bail!(format!(
            "Config file already exists at {config_file_path_str}"
        ));
    }

    if let Some(parent) = config_file_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut file = fs::File::create(&config_file_path).await?;
    file.write_all(Config::serialize_default(build()).as_bytes())
        .await?;

    println!("Created default config file at {config_file_path_str}");
    return Ok(());
}

async fn select_session_interactive(ctx: &AppContext) -> Result<Option<String>> {
    let sessions = ctx.store.get_chat_sessions().await?;
    if sessions.is_empty() {
        println!("There are no sessions available. You should start your first one!");
        return Ok(None);
    }

    let session_options = sessions
        .iter()
        .map(|session| {
            return format_session(session);
        })
        .collect::<Vec<String>>();

    let idx = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Which session would you like to open?")
        .default(0)
        .items(&session_options)
        .interact_opt()?;

    return Ok(idx.map(|idx| return sessions[idx].chat_id.to_string()));
}

fn required_id(matches: &ArgMatches) -> Result<String> {
    let Some(chat_id) = matches.get_one::<String>(&ConfigKey::SessionID.to_string()) else {
        bail!("A session id is required, pass it with --id");
    };

    return Ok(chat_id.to_string());
}

fn arg_session_id(required: bool) -> Arg {
    return Arg::new(ConfigKey::SessionID.to_string())
        .short('i')
        .long("id")
        .help("Session ID")
        .num_args(1)
        .required(required);
}

fn subcommand_completions() -> Command {
    return Command::new("completions")
        .about("Generates shell completions.")
        .arg(
            clap::Arg::new("shell")
                .short('s')
                .long("shell")
                .help("Which shell to generate completions for.")
                .action(ArgAction::Set)
                .value_parser(value_parser!(Shell))
                .required(true),
        );
}

fn subcommand_config() -> Command {
    return Command::new("config")
        .about("Configuration file options.")
        .subcommand(
            Command::new("create").about("Saves the default config file to the configuration file path. This command will fail if the file exists already.")
        )
        .subcommand(
            Command::new("default").about("Outputs the default configuration file to stdout.")
        )
        .subcommand(
            Command::new("path").about("Returns the default path for the configuration file.")
        );
}

fn subcommand_chat() -> Command {
    return Command::new("chat")
        .about("Start a new chat, or continue an existing session when an ID is passed.")
        .arg(arg_session_id(false));
}

fn subcommand_sessions() -> Command {
    return Command::new("sessions")
        .about("Manage chat sessions and keep them in sync with the feed service.")
        .arg_required_else_help(true)
        .subcommand(Command::new("dir").about("Print the local sessions directory path."))
        .subcommand(Command::new("list").about("List all local sessions, most recently updated first."))
        .subcommand(
            Command::new("sync")
                .about("Pull the session list from the feed service into the local store.")
                .arg(
                    Arg::new("unread")
                        .long("unread")
                        .help("Only sync sessions with unseen messages.")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .help("Maximum number of sessions to request.")
                        .num_args(1)
                        .value_parser(value_parser!(u32)),
                ),
        )
        .subcommand(
            Command::new("messages")
                .about("Fetch unseen messages of a session and print the conversation.")
                .arg(arg_session_id(true))
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("Download the full history even if the local copy looks fresh.")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("seen")
                .about("Mark a session as seen on the feed service.")
                .arg(arg_session_id(true)),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete a session locally and on the feed service.")
                .arg(arg_session_id(true)),
        )
        .subcommand(
            Command::new("open")
                .about("Open a session by ID to continue chatting. Omit passing any session ID to load an interactive selection.")
                .arg(arg_session_id(false)),
        );
}

pub fn build() -> Command {
    let commands_text = help_text()
        .split('\n')
        .map(|line| {
            if line.starts_with('-') {
                return format!("  {line}");
            }
            if line.starts_with("COMMANDS:") || line.starts_with("HOTKEYS:") {
                return Paint::new(format!("CHAT {line}"))
                    .underline()
                    .bold()
                    .to_string();
            }
            return line.to_string();
        })
        .collect::<Vec<String>>()
        .join("\n");

    let about = format!(
        "{}\n\nVersion: {}",
        env!("CARGO_PKG_DESCRIPTION"),
        env!("CARGO_PKG_VERSION"),
    );

    return Command::new("feedchat")
        .about(about)
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .after_help(commands_text)
        .arg_required_else_help(false)
        .subcommand(subcommand_chat())
        .subcommand(subcommand_completions())
        .subcommand(subcommand_config())
        .subcommand(subcommand_sessions())
        .arg(
            Arg::new(ConfigKey::ConfigFile.to_string())
                .short('c')
                .long(ConfigKey::ConfigFile.to_string())
                .env("FEEDCHAT_CONFIG_FILE")
                .num_args(1)
                .help(format!("Path to configuration file [default: {}]", Config::default(ConfigKey::ConfigFile)))
                .global(true)
        )
        .arg(
            Arg::new(ConfigKey::Backend.to_string())
                .short('b')
                .long(ConfigKey::Backend.to_string())
                .env("FEEDCHAT_BACKEND")
                .num_args(1)
                .help(format!(
                    "The backend hosting a model to chat with. [default: {}]",
                    Config::default(ConfigKey::Backend)
                ))
                .value_parser(PossibleValuesParser::new(BackendName::VARIANTS))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::BackendHealthCheckTimeout.to_string())
                .long(ConfigKey::BackendHealthCheckTimeout.to_string())
                .env("FEEDCHAT_BACKEND_HEALTH_CHECK_TIMEOUT")
                .num_args(1)
                .help(format!("Time to wait in milliseconds before timing out when doing a healthcheck for a backend. [default: {}]", Config::default(ConfigKey::BackendHealthCheckTimeout)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::Model.to_string())
                .short('m')
                .long(ConfigKey::Model.to_string())
                .env("FEEDCHAT_MODEL")
                .num_args(1)
                .help("The model on a backend to consume. Defaults to the first model available from the backend if not set.")
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::ApiURL.to_string())
                .long(ConfigKey::ApiURL.to_string())
                .env("FEEDCHAT_API_URL")
                .num_args(1)
                .help("Base URL of the feed service hosting remote chat sessions. Sessions stay local when unset.")
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::ApiToken.to_string())
                .long(ConfigKey::ApiToken.to_string())
                .env("FEEDCHAT_API_TOKEN")
                .num_args(1)
                .help("Bearer token sent to the feed service.")
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::DataDir.to_string())
                .long(ConfigKey::DataDir.to_string())
                .env("FEEDCHAT_DATA_DIR")
                .num_args(1)
                .help(format!("Directory holding locally persisted sessions. [default: {}]", Config::default(ConfigKey::DataDir)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::OllamaURL.to_string())
                .long(ConfigKey::OllamaURL.to_string())
                .env("FEEDCHAT_OLLAMA_URL")
                .num_args(1)
                .help(format!("Ollama API URL when using the Ollama backend. [default: {}]", Config::default(ConfigKey::OllamaURL)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::OpenAiURL.to_string())
                .long(ConfigKey::OpenAiURL.to_string())
                .env("FEEDCHAT_OPENAI_URL")
                .num_args(1)
                .help(format!("OpenAI API URL when using the OpenAI backend. Can be swapped to a compatible proxy. [default: {}]", Config::default(ConfigKey::OpenAiURL)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::OpenAiToken.to_string())
                .long(ConfigKey::OpenAiToken.to_string())
                .env("FEEDCHAT_OPENAI_TOKEN")
                .num_args(1)
                .help("OpenAI API token when using the OpenAI backend.")
                .global(true),
        );
}

async fn run_sessions(matches: &ArgMatches, subcmd_matches: &ArgMatches) -> Result<bool> {
    let Some((name, sessions_matches)) = subcmd_matches.subcommand() else {
        subcommand_sessions().print_long_help()?;
        return Ok(false);
    };

    Config::load(build(), vec![matches, subcmd_matches, sessions_matches]).await?;
    let ctx = AppContext::from_config();

    match name {
        "dir" => {
            println!("{}", ctx.store.sessions_dir.to_string_lossy());
        }
        "list" => {
            let sessions = match &ctx.sync {
                Some(sync) => sync.load_sessions_from_db().await?,
                None => ctx.store.get_chat_sessions().await?,
            };
            print_sessions(&sessions);
        }
        "sync" => {
            let filters = SessionFilters {
                unread_only: sessions_matches.get_flag("unread"),
                limit: sessions_matches.get_one::<u32>("limit").copied(),
            };
            let sync = ctx.require_sync()?;
            let mut list = sync.sessions().subscribe();
            let progress = tokio::spawn(async move {
                while list.changed().await.is_ok() {
                    if list.borrow_and_update().is_syncing {
                        eprintln!("{}", Paint::new("Syncing sessions from the feed service...").dimmed());
                        return;
                    }
                }
            });
            let res = sync.sync_sessions_and_messages_from_server(&filters).await;
            progress.abort();
            let sessions = res?;
            let stats = sync.sessions().get().stats;
            println!(
                "{}",
                Paint::green(format!("Synced {} sessions from the feed service", stats.sessions))
            );
            print_sessions(&sessions);
        }
        "messages" => {
            let chat_id = required_id(sessions_matches)?;
            let sync = ctx.require_sync()?;
            let messages = if sessions_matches.get_flag("force") {
                sync.refetch_session_messages(&chat_id).await?
            } else {
                sync.sync_session_messages(&chat_id).await?
            };

            if messages.is_empty() {
                println!("Session {chat_id} has no messages.");
            }
            for message in messages.iter() {
                println!("{}", format_message(message));
            }
        }
        "seen" => {
            let chat_id = required_id(sessions_matches)?;
            ctx.require_sync()?.mark_session_seen(&chat_id).await?;
            println!("Marked session {chat_id} as seen");
        }
        "delete" => {
            let chat_id = required_id(sessions_matches)?;
            match &ctx.sync {
                Some(sync) => sync.delete_session(&chat_id).await?,
                None => ctx.store.delete_session(&chat_id).await?,
            }
            println!("Deleted session {chat_id}");
        }
        "open" => {
            if sessions_matches
                .get_one::<String>(&ConfigKey::SessionID.to_string())
                .is_some()
            {
                return Ok(true);
            }

            let Some(chat_id) = select_session_interactive(&ctx).await? else {
                return Ok(false);
            };
            Config::set(ConfigKey::SessionID, &chat_id);
            return Ok(true);
        }
        _ => {
            subcommand_sessions().print_long_help()?;
        }
    }

    return Ok(false);
}

/// Parses arguments and runs one-shot commands. Returns `true` when the
/// interactive chat should start with the loaded configuration.
pub async fn parse() -> Result<bool> {
    let matches = build().get_matches();

    match matches.subcommand() {
        Some(("chat", subcmd_matches)) => {
            Config::load(build(), vec![&matches, subcmd_matches]).await?;
        }
        Some(("completions", subcmd_matches)) => {
            if let Some(completions) = subcmd_matches.get_one::<Shell>("shell").copied() {
                let mut app = build();
                print_completions(completions, &mut app);
            }
        }
        Some(("config", subcmd_matches)) => match subcmd_matches.subcommand() {
            Some(("create", _)) => {
                create_config_file().await?;
                return Ok(false);
            }
            Some(("default", _)) => {
                println!("{}", Config::serialize_default(build()));
                return Ok(false);
            }
            Some(("path", _)) => {
                println!("{}", Config::default(ConfigKey::ConfigFile));
                return Ok(false);
            }
            _ => {
                subcommand_config().print_long_help()?;
                return Ok(false);
            }
        },
        Some(("sessions", subcmd_matches)) => {
            return run_sessions(&matches, subcmd_matches).await;
        }
        _ => {
            Config::load(build(), vec![&matches]).await?;
        }
    }

    return Ok(true);
}
