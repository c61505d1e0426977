//! Operator Console
//!
//! Line-oriented commands for a running server. Parsing is separate from
//! execution so both can be tested without a terminal.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::core::player::PlayerId;
use crate::network::monitor::{render_appearances, render_disconnected, render_players};
use crate::network::server::{PresenceServer, ServerError};

/// Console errors.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Blank line.
    #[error("empty command")]
    Empty,

    /// Not a known command.
    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),

    /// A required argument is absent.
    #[error("{command}: missing {argument}")]
    MissingArgument {
        /// Command name.
        command: &'static str,
        /// Argument name.
        argument: &'static str,
    },

    /// An argument did not parse.
    #[error("{command}: invalid {argument} {value:?}")]
    InvalidArgument {
        /// Command name.
        command: &'static str,
        /// Argument name.
        argument: &'static str,
        /// Text given.
        value: String,
    },

    /// No connected player matches.
    #[error("no connected player matches {0:?}")]
    NoSuchPlayer(String),

    /// More than one connected player matches.
    #[error("{0:?} matches more than one player")]
    Ambiguous(String),

    /// The server refused.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Why the console loop gave up.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The input stream failed.
    #[error("reading console: {0}")]
    Input(#[from] io::Error),

    /// A background task of the server failed.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Who to ban.
#[derive(Clone, Debug, PartialEq)]
pub enum BanTarget {
    /// An address.
    Address(IpAddr),
    /// A connected player by id or id prefix.
    Player(String),
}

/// One console command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// List commands.
    Help,
    /// Bind address, connection count, filters, time scale.
    Status,
    /// Live players.
    List,
    /// Recently disconnected players.
    Disconnected,
    /// Cached appearances.
    Appearances,
    /// Close one player's session.
    Kick(String),
    /// Block an address (or a player's address) and close its sessions.
    Ban(BanTarget),
    /// Replace the allow list.
    Allow(String),
    /// Replace the block list.
    Block(String),
    /// Enforce or relax the allow list.
    AllowList(bool),
    /// Change the world time scale.
    TimeScale(f32),
    /// Shut the server down.
    Stop,
}

impl Command {
    /// Parse one input line.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        if name.is_empty() {
            return Err(CommandError::Empty);
        }

        match name.to_ascii_lowercase().as_str() {
            "help" | "?" => Ok(Self::Help),
            "status" => Ok(Self::Status),
            "list" | "players" => Ok(Self::List),
            "disconnected" => Ok(Self::Disconnected),
            "appearances" => Ok(Self::Appearances),
            "kick" => Ok(Self::Kick(required(rest, "kick", "player id")?.to_string())),
            "ban" => {
                let target = required(rest, "ban", "player id or address")?;
                Ok(Self::Ban(match target.parse::<IpAddr>() {
                    Ok(ip) => BanTarget::Address(ip),
                    Err(_) => BanTarget::Player(target.to_string()),
                }))
            }
            "allow" => Ok(Self::Allow(rest.to_string())),
            "block" => Ok(Self::Block(rest.to_string())),
            "allowlist" => match required(rest, "allowlist", "on|off")?.to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => Ok(Self::AllowList(true)),
                "off" | "false" | "0" => Ok(Self::AllowList(false)),
                other => Err(CommandError::InvalidArgument {
                    command: "allowlist",
                    argument: "on|off",
                    value: other.to_string(),
                }),
            },
            "timescale" => {
                let text = required(rest, "timescale", "scale")?;
                match text.parse::<f32>() {
                    Ok(v) if v.is_finite() && v >= 0.0 => Ok(Self::TimeScale(v)),
                    _ => Err(CommandError::InvalidArgument {
                        command: "timescale",
                        argument: "scale",
                        value: text.to_string(),
                    }),
                }
            }
            "stop" | "quit" | "exit" => Ok(Self::Stop),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn required<'a>(rest: &'a str, command: &'static str, argument: &'static str) -> Result<&'a str, CommandError> {
    if rest.is_empty() {
        Err(CommandError::MissingArgument { command, argument })
    } else {
        Ok(rest)
    }
}

/// Command help text.
pub const HELP: &str = "\
help                     this text
status                   listener, connections, filters, time scale
list                     connected players
disconnected             recently disconnected players
appearances              cached appearances
kick <id>                close a player's session (id or prefix)
ban <id|address>         block an address and close its sessions
allow <spec>             replace the allow list
block <spec>             replace the block list
allowlist on|off         enforce the allow list
timescale <scale>        set the world time scale
stop                     shut down";

/// Result of running a command.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    /// Lines to print.
    pub lines: Vec<String>,
    /// The operator asked to stop.
    pub stop: bool,
}

impl Outcome {
    fn lines(lines: Vec<String>) -> Self {
        Self { lines, stop: false }
    }

    fn line(line: impl fmt::Display) -> Self {
        Self::lines(vec![line.to_string()])
    }
}

/// Run `command` against `server`.
pub fn execute(server: &PresenceServer, command: Command) -> Result<Outcome, CommandError> {
    Ok(match command {
        Command::Help => Outcome::lines(HELP.lines().map(str::to_string).collect()),
        Command::Status => {
            let filters = server.filters();
            Outcome::lines(vec![
                format!(
                    "listening on {}",
                    server
                        .local_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "-".into())
                ),
                format!("connections: {}", server.connection_count()),
                format!("players: {}", server.registry().len()),
                format!(
                    "allow list ({}): {}",
                    if filters.allow_enabled { "on" } else { "off" },
                    filters.allow
                ),
                format!("block list: {}", filters.block),
                format!("time scale: {}", server.time_scale()),
            ])
        }
        Command::List => Outcome::lines(render_players(&server.players())),
        Command::Disconnected => Outcome::lines(render_disconnected(&server.disconnected(), Instant::now())),
        Command::Appearances => Outcome::lines(render_appearances(&server.appearance_list())),
        Command::Kick(who) => {
            let id = resolve_player(server, &who)?;
            let addr = server.kick(&id)?;
            Outcome::line(format!("kicked {} ({})", id.short(), addr))
        }
        Command::Ban(BanTarget::Address(ip)) => {
            let closed = server.ban_address(ip);
            Outcome::line(format!("banned {} ({} sessions closed)", ip, closed))
        }
        Command::Ban(BanTarget::Player(who)) => {
            let id = resolve_player(server, &who)?;
            let ip = server.ban_player(&id)?;
            Outcome::line(format!("banned {} ({})", ip, id.short()))
        }
        Command::Allow(spec) => {
            server.set_allow_list(&spec);
            Outcome::line(format!("allow list: {}", server.filters().allow))
        }
        Command::Block(spec) => {
            server.set_block_list(&spec);
            Outcome::line(format!("block list: {}", server.filters().block))
        }
        Command::AllowList(on) => {
            server.set_allow_list_enabled(on);
            Outcome::line(format!("allow list {}", if on { "enforced" } else { "relaxed" }))
        }
        Command::TimeScale(scale) => {
            server.set_time_scale(scale);
            Outcome::line(format!("time scale {}", scale))
        }
        Command::Stop => Outcome {
            lines: vec!["stopping".to_string()],
            stop: true,
        },
    })
}

/// Read commands from `input` until `stop`, `interrupt` or a failure
/// reported by `health`, which is checked every `health_every`.
///
/// End of input does not stop the loop: the server keeps running
/// unattended and is still health-checked.
pub async fn run<R, I, H>(
    server: &PresenceServer,
    input: R,
    interrupt: I,
    health_every: Duration,
    mut health: H,
) -> Result<(), ConsoleError>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = ()>,
    H: FnMut() -> Result<(), ServerError>,
{
    let mut lines = input.lines();
    let mut input_closed = false;
    let mut ticker = interval(health_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            line = lines.next_line(), if !input_closed => match line? {
                Some(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Command::parse(&line).and_then(|cmd| execute(server, cmd)) {
                        Ok(outcome) => {
                            for l in &outcome.lines {
                                println!("{}", l);
                            }
                            if outcome.stop {
                                return Ok(());
                            }
                        }
                        Err(e) => println!("{}", e),
                    }
                }
                None => {
                    info!("Console closed; serving until interrupted");
                    input_closed = true;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = health() {
                    error!("Server failure: {}", e);
                    return Err(e.into());
                }
            }
            _ = &mut interrupt => return Ok(()),
        }
    }
}

/// Find a connected player by full id or unique prefix.
fn resolve_player(server: &PresenceServer, text: &str) -> Result<PlayerId, CommandError> {
    if let Some(id) = PlayerId::parse(text) {
        return Ok(id);
    }
    let prefix = text.to_ascii_lowercase();
    let matches: Vec<PlayerId> = server
        .sessions()
        .into_iter()
        .map(|s| s.id)
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(CommandError::NoSuchPlayer(text.to_string())),
        _ => Err(CommandError::Ambiguous(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::ServerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("  list ").unwrap(), Command::List);
        assert_eq!(Command::parse("KICK ab12").unwrap(), Command::Kick("ab12".into()));
        assert_eq!(
            Command::parse("ban 10.0.0.5").unwrap(),
            Command::Ban(BanTarget::Address("10.0.0.5".parse().unwrap()))
        );
        assert_eq!(Command::parse("ban ab12").unwrap(), Command::Ban(BanTarget::Player("ab12".into())));
        assert_eq!(
            Command::parse("block 10.0.0.5, 192.168.").unwrap(),
            Command::Block("10.0.0.5, 192.168.".into())
        );
        assert_eq!(Command::parse("allow").unwrap(), Command::Allow(String::new()));
        assert_eq!(Command::parse("allowlist on").unwrap(), Command::AllowList(true));
        assert_eq!(Command::parse("timescale 0.5").unwrap(), Command::TimeScale(0.5));
        assert_eq!(Command::parse("quit").unwrap(), Command::Stop);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Command::parse("   "), Err(CommandError::Empty)));
        assert!(matches!(Command::parse("dance"), Err(CommandError::Unknown(_))));
        assert!(matches!(
            Command::parse("kick"),
            Err(CommandError::MissingArgument { command: "kick", .. })
        ));
        assert!(matches!(
            Command::parse("allowlist maybe"),
            Err(CommandError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Command::parse("timescale -1"),
            Err(CommandError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Command::parse("timescale fast"),
            Err(CommandError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_execute_filters_and_scale() {
        let server = PresenceServer::new(ServerConfig::default());

        execute(&server, Command::parse("block 10.0.0.5").unwrap()).unwrap();
        assert!(!server.filters().admits(&"10.0.0.5".parse().unwrap()));

        execute(&server, Command::parse("timescale 2").unwrap()).unwrap();
        assert_eq!(server.time_scale(), 2.0);

        let status = execute(&server, Command::Status).unwrap();
        assert!(status.lines.iter().any(|l| l == "block list: 10.0.0.5"));
        assert!(!status.stop);

        assert!(execute(&server, Command::Stop).unwrap().stop);
    }

    #[test]
    fn test_kick_unknown_player() {
        let server = PresenceServer::new(ServerConfig::default());
        assert!(matches!(
            execute(&server, Command::Kick("deadbeef".into())),
            Err(CommandError::NoSuchPlayer(_))
        ));
        let id = PlayerId::new_v4().to_string();
        assert!(matches!(
            execute(&server, Command::Kick(id)),
            Err(CommandError::Server(ServerError::UnknownPlayer(_)))
        ));
    }

    #[test]
    fn test_help_lists_every_command() {
        let help = execute(&PresenceServer::new(ServerConfig::default()), Command::Help).unwrap();
        for name in ["status", "kick", "ban", "allowlist", "timescale", "stop"] {
            assert!(help.lines.iter().any(|l| l.starts_with(name)), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_command() {
        let server = PresenceServer::new(ServerConfig::default());
        let input: &[u8] = b"status\n\nbogus\ntimescale 0.5\nstop\nlist\n";

        let result = timeout(
            Duration::from_secs(2),
            run(&server, input, std::future::pending(), Duration::from_millis(10), || Ok(())),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(server.time_scale(), 0.5);
    }

    #[tokio::test]
    async fn test_run_keeps_checking_health_after_input_closes() {
        let server = PresenceServer::new(ServerConfig::default());
        let checks = AtomicUsize::new(0);
        let input: &[u8] = b"";

        let result = timeout(
            Duration::from_secs(2),
            run(&server, input, std::future::pending(), Duration::from_millis(10), || {
                if checks.fetch_add(1, Ordering::SeqCst) < 5 {
                    Ok(())
                } else {
                    Err(ServerError::Fatal("accept loop died".into()))
                }
            }),
        )
        .await;
        assert!(matches!(result, Ok(Err(ConsoleError::Server(ServerError::Fatal(_))))));
        assert!(checks.load(Ordering::SeqCst) > 5);
    }

    #[tokio::test]
    async fn test_run_serves_until_interrupted_after_input_closes() {
        let server = PresenceServer::new(ServerConfig::default());
        let input: &[u8] = b"";
        let started = Instant::now();

        let result = run(
            &server,
            input,
            tokio::time::sleep(Duration::from_millis(150)),
            Duration::from_millis(10),
            || Ok(()),
        )
        .await;
        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
