//! Line protocol state machine
//!
//! One `Session` per connection. Input lines go in, at most one reply line
//! comes out per input line. Line terminators are added by the connection.

use crate::config::ConfigProvider;
use crate::core::{subscribe_shared, ConnectionId, SharedState};
use log::{debug, info};
use std::sync::Arc;
use thiserror::Error;

pub const REPLY_AUTH_OK: &str = "SUP";
pub const REPLY_AUTH_FAILED: &str = "STFU";
pub const REPLY_GOOD: &str = "GOOD";
pub const REPLY_ERROR: &str = "ERROR";
pub const REPLY_BYE: &str = "PEACE";

const PASS_PREFIX: &str = "pass:";

/// Malformed client input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{0} needs arguments")]
    MissingArguments(&'static str),

    #[error("malformed arguments: {0}")]
    Malformed(String),

    #[error("unknown config type: {0}")]
    BadConfigType(String),
}

/// Type requested by a `cfg` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgType {
    String,
    Int,
    Double,
    Bool,
}

impl CfgType {
    fn parse(raw: &str) -> Result<Self, ProtocolError> {
        match raw.trim() {
            "0" => Ok(CfgType::String),
            "1" => Ok(CfgType::Int),
            "2" => Ok(CfgType::Double),
            "3" => Ok(CfgType::Bool),
            other => Err(ProtocolError::BadConfigType(other.to_string())),
        }
    }
}

/// A parsed, authenticated command
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Subscribe {
        id: &'a str,
        name: &'a str,
        arg: Option<&'a str>,
        once: bool,
    },
    Bye,
    Config {
        id: &'a str,
        module: &'a str,
        key: &'a str,
        kind: CfgType,
    },
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Result<Self, ProtocolError> {
        let (command, args) = match line.split_once(' ') {
            Some((command, args)) => (command, Some(args)),
            None => (line, None),
        };
        match command {
            "var" | "varonce" => {
                let once = command == "varonce";
                let args = args.ok_or(ProtocolError::MissingArguments("var"))?;
                let (id, name, arg) = parse_var_args(args)?;
                Ok(Command::Subscribe { id, name, arg, once })
            }
            "bye" => Ok(Command::Bye),
            "cfg" => {
                let args = args.ok_or(ProtocolError::MissingArguments("cfg"))?;
                parse_cfg_args(args)
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// `<id>:<name>[ <args>]`
fn parse_var_args(args: &str) -> Result<(&str, &str, Option<&str>), ProtocolError> {
    let (id, rest) = args
        .trim_start()
        .split_once(':')
        .ok_or_else(|| ProtocolError::Malformed(args.to_string()))?;
    let (name, arg) = match rest.split_once(' ') {
        Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (rest.trim_end(), None),
    };
    if id.is_empty() || name.is_empty() {
        return Err(ProtocolError::Malformed(args.to_string()));
    }
    Ok((id, name, arg))
}

/// `<id>:<mod>:<key>:<type>`; the key may itself contain colons
fn parse_cfg_args(args: &str) -> Result<Command<'_>, ProtocolError> {
    let malformed = || ProtocolError::Malformed(args.to_string());
    let mut parts = args.trim().splitn(3, ':');
    let id = parts.next().ok_or_else(malformed)?;
    let module = parts.next().ok_or_else(malformed)?;
    let rest = parts.next().ok_or_else(malformed)?;
    let (key, kind) = rest.rsplit_once(':').ok_or_else(malformed)?;
    if id.is_empty() || module.is_empty() || key.is_empty() {
        return Err(malformed());
    }
    Ok(Command::Config {
        id,
        module,
        key,
        kind: CfgType::parse(kind)?,
    })
}

/// Format a `cfg` reply value
pub fn config_value(config: &dyn ConfigProvider, module: &str, key: &str, kind: CfgType) -> String {
    match kind {
        CfgType::String => format!("\"{}\"", config.get_string(module, key, "")),
        CfgType::Int => config.get_int(module, key, 0).to_string(),
        CfgType::Double => config.get_double(module, key, 0.0).to_string(),
        CfgType::Bool => u8::from(config.get_bool(module, key, false)).to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
}

/// What the connection should do after a line
#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    /// Nothing to send
    Silent,
    Reply(String),
    /// Send the reply, then close the connection
    Farewell(String),
}

/// Protocol state for one connection
pub struct Session {
    connection: ConnectionId,
    state: SessionState,
    password: Option<String>,
    config: Arc<dyn ConfigProvider>,
    shared: SharedState,
}

impl Session {
    pub fn new(
        connection: ConnectionId,
        password: Option<String>,
        config: Arc<dyn ConfigProvider>,
        shared: SharedState,
    ) -> Self {
        Self {
            connection,
            state: SessionState::Unauthenticated,
            password,
            config,
            shared,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle one input line without its terminator
    pub async fn handle_line(&mut self, line: &str) -> Response {
        if line.trim().is_empty() {
            return Response::Silent;
        }
        match self.state {
            SessionState::Unauthenticated => self.authenticate(line).await,
            SessionState::Authenticated => self.dispatch(line).await,
        }
    }

    async fn authenticate(&mut self, line: &str) -> Response {
        let Some(password) = self.password.as_deref() else {
            self.state = SessionState::Authenticated;
            return self.dispatch(line).await;
        };
        let Some(token) = line.strip_prefix(PASS_PREFIX) else {
            debug!("Ignoring input from unauthenticated {}", self.connection);
            return Response::Silent;
        };
        if token.trim() == password {
            debug!("Connection {} authenticated", self.connection);
            self.state = SessionState::Authenticated;
            Response::Reply(REPLY_AUTH_OK.to_string())
        } else {
            info!("Connection {} sent a wrong password", self.connection);
            Response::Reply(REPLY_AUTH_FAILED.to_string())
        }
    }

    async fn dispatch(&mut self, line: &str) -> Response {
        let command = match Command::parse(line.trim_end()) {
            Ok(command) => command,
            Err(e) => {
                debug!("Connection {}: {}", self.connection, e);
                return error();
            }
        };

        match command {
            Command::Subscribe { id, name, arg, once } => {
                let result =
                    subscribe_shared(&self.shared, self.connection, id, name, arg, once).await;
                match result {
                    Ok(_) => Response::Reply(REPLY_GOOD.to_string()),
                    Err(e) => {
                        debug!("Connection {}: {}", self.connection, e);
                        error()
                    }
                }
            }
            Command::Bye => Response::Farewell(REPLY_BYE.to_string()),
            Command::Config { id, module, key, kind } => {
                let value = config_value(self.config.as_ref(), module, key, kind);
                Response::Reply(format!("cfg:{}:{}", id, value))
            }
        }
    }
}

fn error() -> Response {
    Response::Reply(REPLY_ERROR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::core::state::tests::{connect, state};
    use crate::core::lock;
    use tokio::sync::mpsc::Receiver;

    fn settings(password: Option<&str>) -> Settings {
        let json = r#"{"mpd": {"port": 6600, "host": "localhost", "gain": 0.5, "random": true}}"#;
        let mut settings: Settings = serde_json::from_str(json).unwrap();
        settings.password = password.map(str::to_string);
        settings
    }

    fn session(password: Option<&str>) -> (Session, SharedState, Receiver<String>) {
        let mut inner = state();
        let (conn, rx) = connect(&mut inner);
        let shared = inner.into_shared();
        let settings = settings(password);
        let session = Session::new(
            conn,
            settings.password().map(str::to_string),
            Arc::new(settings),
            shared.clone(),
        );
        (session, shared, rx)
    }

    fn reply(text: &str) -> Response {
        Response::Reply(text.to_string())
    }

    #[tokio::test]
    async fn test_password_flow() {
        let (mut session, _, _rx) = session(Some("hunter2"));
        assert_eq!(session.handle_line("pass: wrong").await, reply("STFU"));
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert_eq!(session.handle_line("pass: hunter2").await, reply("SUP"));
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(session.handle_line("var 1:battper").await, reply("GOOD"));
    }

    #[tokio::test]
    async fn test_unauthenticated_commands_are_ignored() {
        let (mut session, shared, _rx) = session(Some("hunter2"));
        assert_eq!(session.handle_line("var 1:battper").await, Response::Silent);
        assert_eq!(session.handle_line("bye").await, Response::Silent);
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(lock(&shared).subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_no_password_dispatches_first_line() {
        let (mut session, shared, _rx) = session(None);
        assert_eq!(session.handle_line("var 1:battper").await, reply("GOOD"));
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(lock(&shared).subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_command_is_one_error() {
        let (mut session, shared, _rx) = session(None);
        assert_eq!(session.handle_line("dance 1:2").await, reply("ERROR"));
        assert_eq!(session.handle_line("VAR 1:battper").await, reply("ERROR"));
        assert!(lock(&shared).subscriptions.is_empty());
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_subscribe_errors() {
        let (mut session, _, _rx) = session(None);
        assert_eq!(session.handle_line("var 1:nosuchvar").await, reply("ERROR"));
        assert_eq!(session.handle_line("var 1").await, reply("ERROR"));
        assert_eq!(session.handle_line("var :battper").await, reply("ERROR"));
        assert_eq!(session.handle_line("var").await, reply("ERROR"));
        assert_eq!(session.handle_line("varonce 2:battbar").await, reply("GOOD"));
    }

    #[tokio::test]
    async fn test_var_reloads_swept_module() {
        let (mut session, shared, _rx) = session(None);
        assert_eq!(lock(&shared).sweep_idle(), 1);
        assert_eq!(session.handle_line("var 1:battbar").await, reply("GOOD"));
        assert!(lock(&shared).registry.find_by_name("battery").is_some());
    }

    #[tokio::test]
    async fn test_cfg_replies() {
        let (mut session, _, _rx) = session(None);
        assert_eq!(session.handle_line("cfg 7:mpd:port:1").await, reply("cfg:7:6600"));
        assert_eq!(session.handle_line("cfg 8:mpd:host:0").await, reply("cfg:8:\"localhost\""));
        assert_eq!(session.handle_line("cfg 9:mpd:gain:2").await, reply("cfg:9:0.5"));
        assert_eq!(session.handle_line("cfg 10:mpd:random:3").await, reply("cfg:10:1"));
        assert_eq!(session.handle_line("cfg 11:mpd:missing:1").await, reply("cfg:11:0"));
        assert_eq!(session.handle_line("cfg 12:mpd:missing:0").await, reply("cfg:12:\"\""));
    }

    #[tokio::test]
    async fn test_cfg_malformed() {
        let (mut session, _, _rx) = session(None);
        assert_eq!(session.handle_line("cfg 7:mpd:port:9").await, reply("ERROR"));
        assert_eq!(session.handle_line("cfg 7:mpd:port").await, reply("ERROR"));
        assert_eq!(session.handle_line("cfg 7").await, reply("ERROR"));
        assert_eq!(session.handle_line("cfg").await, reply("ERROR"));
    }

    #[tokio::test]
    async fn test_bye() {
        let (mut session, _, _rx) = session(None);
        assert_eq!(session.handle_line("bye").await, Response::Farewell("PEACE".to_string()));
    }

    #[test]
    fn test_parse_var_with_args() {
        assert_eq!(
            Command::parse("var 3:cpucore 2"),
            Ok(Command::Subscribe {
                id: "3",
                name: "cpucore",
                arg: Some("2"),
                once: false,
            })
        );
        assert_eq!(
            Command::parse("varonce 4:time %H:%M"),
            Ok(Command::Subscribe {
                id: "4",
                name: "time",
                arg: Some("%H:%M"),
                once: true,
            })
        );
    }

    #[test]
    fn test_parse_cfg_key_with_colons() {
        assert_eq!(
            Command::parse("cfg 1:weather:url:http://x:0"),
            Ok(Command::Config {
                id: "1",
                module: "weather",
                key: "url:http://x",
                kind: CfgType::String,
            })
        );
    }
}
