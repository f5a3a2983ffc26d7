use clap::{Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use lib::relay::{Card, RelayEvent};
use lib::session::Snapshot;
use tokio_tungstenite::tungstenite::Message;

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Tally CLI: live voting relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: TALLY_CONFIG_PATH or ~/.tally/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the relay (HTTP + WebSocket on one port).
    Relay {
        /// Config file path (default: TALLY_CONFIG_PATH or ~/.tally/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Join a session and print its events until the relay goes away.
    Watch {
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Session to join.
        #[arg(long, value_name = "ID")]
        session: String,

        /// User id to join as.
        #[arg(long, value_name = "ID", default_value = "watcher")]
        user: String,
    },

    /// Cast a vote on a card.
    Vote {
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        #[arg(long, value_name = "ID")]
        session: String,

        #[arg(long, value_name = "ID")]
        user: String,

        #[arg(long, value_name = "ID")]
        card: String,

        #[arg(value_enum)]
        choice: VoteChoice,
    },

    /// Announce a new card to everyone in the session.
    AddCard {
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        #[arg(long, value_name = "ID")]
        session: String,

        #[arg(long, value_name = "ID", default_value = "admin")]
        user: String,

        /// Card id.
        #[arg(long, value_name = "ID")]
        id: String,

        /// Card title.
        #[arg(long)]
        title: Option<String>,

        /// Extra card fields; repeatable.
        #[arg(long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum VoteChoice {
    Yes,
    No,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("tally {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Relay { config, port }) => {
            if let Err(e) = run_relay(config, port).await {
                log::error!("relay failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Watch {
            config,
            session,
            user,
        }) => {
            if let Err(e) = run_watch(config, &session, &user).await {
                log::error!("watch failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Vote {
            config,
            session,
            user,
            card,
            choice,
        }) => {
            let event = RelayEvent::vote(card, user.clone(), matches!(choice, VoteChoice::Yes));
            if let Err(e) = send_event(config, &session, &user, event).await {
                log::error!("vote failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::AddCard {
            config,
            session,
            user,
            id,
            title,
            fields,
        }) => {
            let result = match build_card(id, title, &fields) {
                Ok(card) => send_event(config, &session, &user, RelayEvent::card_added(card)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                log::error!("add-card failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let _dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", path.parent().unwrap_or(std::path::Path::new(".")).display());
    Ok(())
}

async fn run_relay(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, _path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.relay.port = p;
    }
    log::info!("starting relay on {}:{}", config.relay.bind, config.relay.port);
    lib::gateway::run_gateway(config).await
}

/// Card from `--id`, `--title` and `--field key=value` pairs (values parsed as JSON when possible).
fn build_card(id: String, title: Option<String>, fields: &[String]) -> Result<Card, String> {
    let mut card = Card::new(id);
    if let Some(title) = title {
        card = card.with_field("title", serde_json::Value::String(title));
    }
    for field in fields {
        let (key, raw) = field
            .split_once('=')
            .ok_or_else(|| format!("field must be KEY=VALUE: {}", field))?;
        let key = key.trim();
        if key.is_empty() || key == "id" {
            return Err(format!("invalid field name: {:?}", key));
        }
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        card = card.with_field(key, value);
    }
    Ok(card)
}

/// Open a socket to the configured relay and complete the connect handshake.
async fn connect_session(
    config_path: Option<std::path::PathBuf>,
    session_id: &str,
    user_id: &str,
) -> Result<Ws, String> {
    let (config, _) = lib::config::load_config(config_path).map_err(|e| e.to_string())?;
    let bind = config.relay.bind.trim();
    let port = config.relay.port;
    let token = lib::config::resolve_relay_token(&config);
    let ws_url = format!("ws://{}:{}/ws", bind, port);

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| e.to_string())?;

    let mut params = serde_json::json!({
        "sessionId": session_id,
        "userId": user_id,
    });
    if let Some(ref t) = token {
        params["auth"] = serde_json::json!({ "token": t });
    }
    let connect_req = serde_json::json!({
        "type": "req",
        "id": "1",
        "method": "connect",
        "params": params
    });
    ws.send(Message::Text(connect_req.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        let Ok(res) = serde_json::from_str::<lib::gateway::WsResponse>(&text) else {
            continue;
        };
        if res.typ != "res" || res.id != "1" {
            continue;
        }
        if !res.ok {
            return Err(res.error.unwrap_or_else(|| "connect failed".to_string()));
        }
        log::debug!("connected to session {} as {}", session_id, user_id);
        return Ok(ws);
    }

    Err("relay closed the connection before hello-ok".to_string())
}

async fn send_event(
    config_path: Option<std::path::PathBuf>,
    session_id: &str,
    user_id: &str,
    event: RelayEvent,
) -> Result<(), String> {
    let mut ws = connect_session(config_path, session_id, user_id).await?;
    ws.send(Message::Text(event.to_frame()))
        .await
        .map_err(|e| e.to_string())?;
    ws.close(None).await.map_err(|e| e.to_string())?;
    println!("sent {} to session {}", event.kind(), session_id);
    Ok(())
}

async fn run_watch(
    config_path: Option<std::path::PathBuf>,
    session_id: &str,
    user_id: &str,
) -> Result<(), String> {
    let mut ws = connect_session(config_path, session_id, user_id).await?;
    println!("watching session {} as {} (Ctrl+C to stop)", session_id, user_id);

    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        if let Ok(event) = serde_json::from_str::<RelayEvent>(&text) {
            println!("{}", describe_event(&event));
            continue;
        }
        if let Ok(snapshot) = serde_json::from_str::<Snapshot>(&text) {
            print_snapshot(&snapshot);
            continue;
        }
        if text == lib::relay::SHUTDOWN_FRAME {
            println!("relay shut down");
            break;
        }
        log::debug!("ignoring frame: {}", text);
    }
    Ok(())
}

fn describe_event(event: &RelayEvent) -> String {
    match event {
        RelayEvent::Vote(v) => format!(
            "{} voted {} on {}",
            v.user_id,
            if v.vote { "yes" } else { "no" },
            v.card_id
        ),
        RelayEvent::CardAdded(added) => match added.card.fields.get("title").and_then(|t| t.as_str()) {
            Some(title) => format!("card {} added: {}", added.card.id, title),
            None => format!("card {} added", added.card.id),
        },
    }
}

fn print_snapshot(snapshot: &Snapshot) {
    println!(
        "session {}: {} card(s) as of {}",
        snapshot.session_id,
        snapshot.cards.len(),
        snapshot.taken_at
    );
    for card in &snapshot.cards {
        let count = snapshot.counts.get(&card.id).copied().unwrap_or_default();
        let mine = match snapshot.votes.get(&card.id) {
            Some(true) => " (you: yes)",
            Some(false) => " (you: no)",
            None => "",
        };
        println!("  {}: {} yes / {} no{}", card.id, count.yes, count.no, mine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_card_parses_fields() {
        let card = build_card(
            "c1".to_string(),
            Some("Lunch?".to_string()),
            &["position=3".to_string(), "tag=food".to_string()],
        )
        .unwrap();
        assert_eq!(card.id, "c1");
        assert_eq!(card.fields["title"], "Lunch?");
        assert_eq!(card.fields["position"], 3);
        assert_eq!(card.fields["tag"], "food");
    }

    #[test]
    fn build_card_rejects_bad_fields() {
        assert!(build_card("c1".to_string(), None, &["nokey".to_string()]).is_err());
        assert!(build_card("c1".to_string(), None, &["id=2".to_string()]).is_err());
    }

    #[test]
    fn describes_votes_and_cards() {
        assert_eq!(
            describe_event(&RelayEvent::vote("c1", "u1", false)),
            "u1 voted no on c1"
        );
        let card = Card::new("c2").with_field("title", serde_json::json!("Ship it?"));
        assert_eq!(
            describe_event(&RelayEvent::card_added(card)),
            "card c2 added: Ship it?"
        );
    }
}
