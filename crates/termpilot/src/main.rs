use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use termpilot_cli::{AuthArgs, Cli, Command, SessionCommand};
use termpilot_config::{AppConfig, AppPaths, ConfigManager, AI_KEY_ENV};
use termpilot_core::{
    AssistantOrchestrator, AuthMethod, ChatMessage, ConnectionManager, CoreError, Event, EventBus,
    NotificationLevel, OpenAiClient, RusshTransport, SavedSession, SessionData, SessionStore,
    StoredAuth,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use zeroize::Zeroizing;

const PASSWORD_ENV: &str = "TERMPILOT_PASSWORD";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = AppPaths::new()?;
    let config_manager = ConfigManager::new(paths.clone());
    let overrides = match cli.config.as_deref() {
        Some(path) => Some(
            ConfigManager::load_layer(Path::new(path))
                .with_context(|| format!("failed to read config {path}"))?,
        ),
        None => None,
    };
    let config = config_manager.load(std::env::current_dir().ok().as_deref(), overrides)?;
    let interactive = matches!(cli.command, Command::Connect { .. });
    let _log_guard = init_logging(&config, &paths, config.logging.stdout && !interactive)?;

    let store = SessionStore::new(paths.db_file.clone());
    store.init()?;
    let (config, paths, store) = (&config, &paths, &store);

    match cli.command {
        Command::Config { init } => {
            if init {
                config_manager.save_default()?;
                println!("config initialized at {}", paths.config_file.display());
            } else {
                println!("config file: {}", paths.config_file.display());
                println!("session store: {}", paths.db_file.display());
                println!("logs: {}", paths.log_dir.display());
            }
        }
        Command::Sessions { command } => handle_sessions(store, command)?,
        Command::Connect { target, auth } => {
            let (data, saved) = resolve_target(store, &target, &auth)?;
            with_manager(config, |manager| async move {
                connect(&manager, store, data.clone(), saved.as_ref()).await?;
                run_interactive(&manager, &data, config, paths).await
            })
            .await?;
        }
        Command::Exec {
            target,
            auth,
            command,
        } => {
            let (data, saved) = resolve_target(store, &target, &auth)?;
            let command = command.join(" ");
            with_manager(config, |manager| async move {
                connect(&manager, store, data.clone(), saved.as_ref()).await?;
                let res = manager.execute_command(&data.id, &command).await?;
                if !res.output.is_empty() {
                    println!("{}", res.output);
                }
                if let Some(err) = &res.error {
                    eprintln!("{err}");
                }
                if !res.success {
                    anyhow::bail!(
                        "command failed with exit code {}",
                        res.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string())
                    );
                }
                Ok(())
            })
            .await?;
        }
        Command::Monitor {
            target,
            auth,
            samples,
        } => {
            let (data, saved) = resolve_target(store, &target, &auth)?;
            with_manager(config, |manager| async move {
                let mut events = manager.bus().subscribe();
                connect(&manager, store, data.clone(), saved.as_ref()).await?;
                let wait = Duration::from_millis(config.monitoring.metrics_interval_ms * 5)
                    .max(Duration::from_secs(5));
                let mut seen = 0;
                while seen < samples {
                    match tokio::time::timeout(wait, next_metrics(&mut events, &data.id)).await {
                        Ok(Some(line)) => {
                            println!("{line}");
                            seen += 1;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            eprintln!("no metrics received; the monitoring channel may be unavailable");
                            break;
                        }
                    }
                }
                Ok(())
            })
            .await?;
        }
        Command::Ask {
            target,
            auth,
            question,
        } => {
            let (data, saved) = resolve_target(store, &target, &auth)?;
            let question = question.join(" ");
            with_manager(config, |manager| async move {
                let Some(assistant) = build_assistant(&manager, config)? else {
                    print_ai_setup_hint(paths);
                    return Ok(());
                };
                connect(&manager, store, data.clone(), saved.as_ref()).await?;
                let reply = assistant.ask(&data.id, &question, &[]).await?;
                print_reply(&reply);
                Ok(())
            })
            .await?;
        }
    }

    Ok(())
}

fn init_logging(
    config: &AppConfig,
    paths: &AppPaths,
    enable_stdout: bool,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&paths.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "termpilot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let file_layer = if config.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    if enable_stdout {
        let stdout_layer = if config.logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stdout)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .boxed()
        };
        tracing::subscriber::set_global_default(subscriber.with(stdout_layer))?;
    } else {
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(guard)
}

/// Runs `f` against a started manager and always shuts the manager down.
async fn with_manager<F, Fut>(config: &AppConfig, f: F) -> Result<()>
where
    F: FnOnce(ConnectionManager) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let transport = Arc::new(RusshTransport::new(config.ssh.clone()));
    let manager = ConnectionManager::new(transport, EventBus::new(256), config.clone());
    manager.start();
    let result = f(manager.clone()).await;
    manager.shutdown().await;
    result
}

async fn connect(
    manager: &ConnectionManager,
    store: &SessionStore,
    data: SessionData,
    saved: Option<&SavedSession>,
) -> Result<()> {
    let label = format!("{}@{}:{}", data.username, data.host, data.port);
    manager
        .connect(data)
        .await
        .with_context(|| format!("could not connect to {label}"))?;
    if let Some(saved) = saved {
        if let Err(err) = store.touch_last_connected(saved.id) {
            warn!(session = %saved.name, error = %err, "failed to update last connected time");
        }
    }
    Ok(())
}

async fn run_interactive(
    manager: &ConnectionManager,
    data: &SessionData,
    config: &AppConfig,
    paths: &AppPaths,
) -> Result<()> {
    let id = data.id.as_str();
    let notifier = spawn_notifier(manager.bus());
    let assistant = build_assistant(manager, config)?;
    let mut history: Vec<ChatMessage> = Vec::new();

    println!("connected to {}; `? question` asks the assistant, :status, :quit", data.name);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}> ", data.name);
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            ":quit" | ":q" => break,
            ":status" => {
                print_status(manager, id);
                continue;
            }
            _ => {}
        }

        if let Some(question) = line.strip_prefix("? ") {
            manager.record_activity(id);
            let Some(assistant) = assistant.as_ref() else {
                print_ai_setup_hint(paths);
                continue;
            };
            match assistant.ask(id, question, &history).await {
                Ok(reply) => {
                    print_reply(&reply);
                    history.push(ChatMessage::user(question));
                    history.push(ChatMessage::assistant(reply.content));
                    let excess = history.len().saturating_sub(config.ai.history_max);
                    history.drain(..excess);
                }
                Err(CoreError::NotConnected(_)) => {
                    eprintln!("connection is closed");
                    break;
                }
                Err(err) => eprintln!("assistant error: {err}"),
            }
            continue;
        }

        match manager.execute_command(id, line).await {
            Ok(res) => {
                if !res.output.is_empty() {
                    println!("{}", res.output);
                }
                if let Some(err) = res.error {
                    eprintln!("{err}");
                }
            }
            Err(CoreError::NotConnected(_)) | Err(CoreError::NotFound) => {
                eprintln!("connection is closed");
                break;
            }
            Err(err) => eprintln!("{err}"),
        }
    }

    notifier.abort();
    info!(connection_id = %id, "interactive session ended");
    Ok(())
}

fn spawn_notifier(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::Notification { level, message }) => {
                    let label = match level {
                        NotificationLevel::Info => "info",
                        NotificationLevel::Success => "ok",
                        NotificationLevel::Warning => "warning",
                        NotificationLevel::Error => "error",
                    };
                    eprintln!("\n[{label}] {message}");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn next_metrics(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    id: &str,
) -> Option<String> {
    loop {
        match events.recv().await {
            Ok(Event::MetricsUpdated {
                connection_id,
                info,
            }) if connection_id == id => {
                return Some(format!(
                    "cpu {:5.1}%  mem {:5.1}%  disk {:5.1}%  load {:.2} {:.2} {:.2}  rx {:.0} B/s  tx {:.0} B/s  procs {}",
                    info.cpu,
                    info.memory,
                    info.disk,
                    info.load_average.load1,
                    info.load_average.load5,
                    info.load_average.load15,
                    info.network_down_rate,
                    info.network_up_rate,
                    info.process_count
                ));
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn build_assistant(
    manager: &ConnectionManager,
    config: &AppConfig,
) -> Result<Option<AssistantOrchestrator>> {
    match OpenAiClient::from_config(&config.ai) {
        Ok(client) => Ok(Some(AssistantOrchestrator::new(
            Arc::new(client),
            manager.bridge(),
            manager.connections().clone(),
            manager.bus().clone(),
            config.ai.clone(),
        ))),
        Err(CoreError::AiConfigNotSet) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn print_ai_setup_hint(paths: &AppPaths) {
    eprintln!(
        "{}: set ai.endpoint, ai.api_key and ai.model in {} (or export {AI_KEY_ENV})",
        CoreError::AiConfigNotSet,
        paths.config_file.display()
    );
}

fn print_reply(reply: &termpilot_core::AssistantReply) {
    for call in &reply.tool_calls {
        let elapsed = call
            .execution_time
            .map(|d| format!("{} ms", d.as_millis()))
            .unwrap_or_default();
        println!("  $ {}  [{:?} {elapsed}]", call.command, call.status);
    }
    println!("{}", reply.content);
}

fn print_status(manager: &ConnectionManager, id: &str) {
    let Some(conn) = manager.connections().get(id) else {
        println!("connection {id} is gone");
        return;
    };
    let since = conn
        .connected_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!("{} ({}@{}:{}) {} since {since}", conn.name, conn.username, conn.host, conn.port, conn.status);
    if let Some(err) = &conn.error_message {
        println!("last error: {err}");
    }
    if let Some(info) = &conn.system_info {
        println!(
            "cpu {:.1}%  mem {:.1}%  disk {:.1}%  load {:.2}  procs {}",
            info.cpu, info.memory, info.disk, info.load_average.load1, info.process_count
        );
    }
    match manager.pool().entry(id) {
        Some(entry) => println!(
            "monitoring channel: {:?} ({} consecutive errors)",
            entry.status, entry.error_count
        ),
        None => println!("monitoring channel: unavailable"),
    }
    if let Some(idle) = manager.idle_status(id) {
        println!(
            "idle {}s, disconnect in {}s{}",
            idle.idle_time.as_secs(),
            idle.remaining_time.as_secs(),
            if idle.will_timeout_soon { " (soon)" } else { "" }
        );
    }
    println!("sessions: {}", manager.sessions().connection_sessions(id).len());
}

fn handle_sessions(store: &SessionStore, command: SessionCommand) -> Result<()> {
    match command {
        SessionCommand::List => {
            let sessions = store.get_sessions()?;
            if sessions.is_empty() {
                println!("no saved sessions");
            }
            for s in sessions {
                let last = s
                    .last_connected_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<20} {}@{}:{}  auth={}  last={last}",
                    s.name,
                    s.username,
                    s.host,
                    s.port,
                    s.auth.as_key()
                );
            }
        }
        SessionCommand::Add { name, target, auth } => {
            let (user, host, port) = parse_target(&target)?;
            let stored = match (&auth.identity, auth.password) {
                (Some(path), _) => StoredAuth::Key {
                    private_key_path: path.clone(),
                },
                (None, true) => StoredAuth::Password,
                (None, false) => StoredAuth::Agent,
            };
            let mut session = SavedSession::new(name.clone(), host, port, user, stored);
            if let Some(existing) = store.find_by_name(&name)? {
                session.id = existing.id;
                session.created_at = existing.created_at;
                session.last_connected_at = existing.last_connected_at;
            }
            store.save_session(&session)?;
            println!("saved {name}");
        }
        SessionCommand::Remove { name } => {
            let Some(session) = store.find_by_name(&name)? else {
                anyhow::bail!("no saved session named {name}");
            };
            store.delete_session(session.id)?;
            println!("removed {name}");
        }
    }
    Ok(())
}

fn resolve_target(
    store: &SessionStore,
    target: &str,
    auth: &AuthArgs,
) -> Result<(SessionData, Option<SavedSession>)> {
    if let Some(saved) = store.find_by_name(target)? {
        let data = saved.to_session_data(password_from_env())?;
        return Ok((data, Some(saved)));
    }
    let (user, host, port) = parse_target(target)?;
    let auth = if let Some(path) = &auth.identity {
        AuthMethod::Key {
            private_key_path: path.clone(),
            passphrase: None,
        }
    } else if auth.password {
        AuthMethod::Password {
            password: password_from_env()
                .with_context(|| format!("set {PASSWORD_ENV} to use password authentication"))?,
        }
    } else {
        AuthMethod::Agent
    };
    let data = SessionData {
        id: format!("{user}@{host}:{port}"),
        name: host.clone(),
        host,
        port,
        username: user,
        auth,
    };
    Ok((data, None))
}

fn password_from_env() -> Option<Zeroizing<String>> {
    std::env::var(PASSWORD_ENV).ok().map(Zeroizing::new)
}

fn parse_target(target: &str) -> Result<(String, String, u16)> {
    let mut user_host = target;
    let mut user = whoami::username();
    let mut port = 22;

    if let Some(at) = target.find('@') {
        user = target[..at].to_string();
        user_host = &target[at + 1..];
    }
    let host = if let Some(colon) = user_host.rfind(':') {
        if let Ok(p) = user_host[colon + 1..].parse::<u16>() {
            port = p;
            &user_host[..colon]
        } else {
            user_host
        }
    } else {
        user_host
    };
    if host.is_empty() {
        anyhow::bail!("invalid target {target}: expected user@host[:port]");
    }
    Ok((user, host.to_string(), port))
}
