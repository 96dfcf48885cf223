use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use crate::namespace::{Namespacing, SEPARATOR};

const SERVER_FLAG: &str = "--server";
const COMMAND_SEPARATOR: &str = "--";

#[derive(Debug, Parser)]
#[command(name = "mcp-aggregator", version, about = "Serve stdio MCP servers over Streamable HTTP")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Spawn the configured MCP servers and expose them on one HTTP port
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "MCP_AGGREGATOR_PORT")]
    port: u16,
    #[arg(long, env = "MCP_AGGREGATOR_HOST", default_value = "127.0.0.1")]
    host: IpAddr,
    #[arg(short, long)]
    verbose: bool,
    /// Seconds to wait for a child's `initialize` reply
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    startup_timeout: u64,
    /// Seconds to wait for a child's reply to a forwarded call
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    call_timeout: u64,
    /// Seconds between SIGTERM and SIGKILL when stopping a child
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    shutdown_grace: u64,
    /// Single-server command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    command: Vec<String>,
}

/// One configured child server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub id: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub startup: Duration,
    pub call: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(30),
            call: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub verbose: bool,
    pub timeouts: Timeouts,
    pub namespacing: Namespacing,
    pub servers: Vec<ServerDescriptor>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Cli(#[from] clap::Error),
    #[error("no MCP servers configured")]
    NoServers,
    #[error("`--server` expects <id> <name> <command> [args...], got {0} token(s)")]
    IncompleteServer(usize),
    #[error("`--` must be followed by a command")]
    MissingCommand,
    #[error("a bare command cannot be combined with `--server` groups")]
    MixedModes,
    #[error("invalid server id `{0}`: ids must be non-empty and must not contain `__`")]
    InvalidServerId(String),
    #[error("duplicate server id `{0}`")]
    DuplicateServerId(String),
    #[error("invalid display name `{0}`: names must be non-empty and must not contain `/`")]
    InvalidDisplayName(String),
    #[error("duplicate display name `{0}`")]
    DuplicateDisplayName(String),
    #[error("failed to bind {addr}: {source}")]
    PortUnavailable {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

impl Config {
    /// Parses `argv` (program name first). Tokens from the first `--server`
    /// or `--` onward describe child servers and never reach clap.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let split_at = args
            .iter()
            .skip(1)
            .position(|arg| arg == SERVER_FLAG || arg == COMMAND_SEPARATOR)
            .map(|index| index + 1)
            .unwrap_or(args.len());
        let (head, tail) = args.split_at(split_at);

        let Cli {
            command: CliCommand::Serve(serve),
        } = Cli::try_parse_from(head)?;

        let (servers, namespacing) = parse_servers(serve.command, tail)?;
        validate_servers(&servers)?;

        Ok(Self {
            bind_addr: SocketAddr::new(serve.host, serve.port),
            verbose: serve.verbose,
            timeouts: Timeouts {
                startup: Duration::from_secs(serve.startup_timeout),
                call: Duration::from_secs(serve.call_timeout),
                shutdown_grace: Duration::from_secs(serve.shutdown_grace),
            },
            namespacing,
            servers,
        })
    }
}

fn parse_servers(
    bare_command: Vec<String>,
    tail: &[String],
) -> Result<(Vec<ServerDescriptor>, Namespacing), ConfigError> {
    match tail.first().map(String::as_str) {
        Some(COMMAND_SEPARATOR) => {
            if !bare_command.is_empty() {
                return Err(ConfigError::MixedModes);
            }
            let command = tail[1..].to_vec();
            if command.is_empty() {
                return Err(ConfigError::MissingCommand);
            }
            Ok((vec![single_server(command)], Namespacing::Passthrough))
        }
        Some(_) => {
            if !bare_command.is_empty() {
                return Err(ConfigError::MixedModes);
            }
            let servers = tail
                .split(|token| token == SERVER_FLAG)
                .skip(1)
                .map(server_group)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((servers, Namespacing::Prefixed))
        }
        None if bare_command.is_empty() => Err(ConfigError::NoServers),
        None => Ok((vec![single_server(bare_command)], Namespacing::Passthrough)),
    }
}

fn server_group(tokens: &[String]) -> Result<ServerDescriptor, ConfigError> {
    let [id, display_name, command, args @ ..] = tokens else {
        return Err(ConfigError::IncompleteServer(tokens.len()));
    };

    Ok(ServerDescriptor {
        id: id.clone(),
        display_name: display_name.clone(),
        command: command.clone(),
        args: args.to_vec(),
    })
}

fn single_server(mut command: Vec<String>) -> ServerDescriptor {
    let program = command.remove(0);
    let name = Path::new(&program)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("server")
        .replace(SEPARATOR, "_");

    ServerDescriptor {
        id: name.clone(),
        display_name: name,
        command: program,
        args: command,
    }
}

fn validate_servers(servers: &[ServerDescriptor]) -> Result<(), ConfigError> {
    if servers.is_empty() {
        return Err(ConfigError::NoServers);
    }

    let mut ids = HashSet::new();
    let mut display_names = HashSet::new();
    for server in servers {
        if server.id.trim().is_empty() || server.id.contains(SEPARATOR) {
            return Err(ConfigError::InvalidServerId(server.id.clone()));
        }
        if !ids.insert(server.id.as_str()) {
            return Err(ConfigError::DuplicateServerId(server.id.clone()));
        }
        if server.display_name.trim().is_empty() || server.display_name.contains('/') {
            return Err(ConfigError::InvalidDisplayName(server.display_name.clone()));
        }
        if !display_names.insert(server.display_name.as_str()) {
            return Err(ConfigError::DuplicateDisplayName(
                server.display_name.clone(),
            ));
        }
    }

    Ok(())
}
