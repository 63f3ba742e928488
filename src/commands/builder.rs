//! Builds commands from request frames.
//!
//! All argument checking happens here, before anything is queued: arity,
//! integer parsing, flag spelling and flag exclusivity. A frame that fails
//! any check becomes a [`CommandError`] and is answered without ever
//! reaching the store.

use crate::commands::{
    Command, CommandError, ExpireFlags, Origin, SetArgs, SetCondition, SetTtl, TtlUnit,
};
use crate::config::MasterAddr;
use crate::protocol::Frame;
use crate::server::ServerContext;
use bytes::Bytes;
use glob_match::glob_match;
use std::sync::Arc;

/// Maps frames to commands for one server.
#[derive(Debug, Clone)]
pub struct CommandFactory {
    ctx: Arc<ServerContext>,
}

impl CommandFactory {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    /// Validates `frame` and turns it into a command.
    ///
    /// Write commands from clients are refused while this node is a replica.
    /// The master's own stream is always accepted.
    pub fn build(&self, frame: &Frame, origin: &Origin) -> Result<Command, CommandError> {
        let command = self.dispatch(frame, origin)?;

        if command.is_write() && origin.client().is_some() && self.ctx.replication.is_replica() {
            return Err(CommandError::ReadOnly);
        }
        Ok(command)
    }

    fn dispatch(&self, frame: &Frame, origin: &Origin) -> Result<Command, CommandError> {
        let name = frame.command_name();
        let args = frame.args();

        match name.as_str() {
            // Connection commands
            "ping" => match args {
                [] => Ok(Command::Ping(None)),
                [message] => Ok(Command::Ping(Some(message.clone()))),
                _ => Err(wrong_arity(&name)),
            },
            "echo" => match args {
                [message] => Ok(Command::Echo(message.clone())),
                _ => Err(wrong_arity(&name)),
            },
            "hello" => self.hello(args, origin),
            "select" => match args {
                [index] => match parse_int(index)? {
                    0 => Ok(Command::Select),
                    _ => Err(CommandError::DbIndexOutOfRange),
                },
                _ => Err(wrong_arity(&name)),
            },
            "client" => client(frame, origin),

            // Keyspace commands
            "get" => match args {
                [key] => Ok(Command::Get { key: key.clone() }),
                _ => Err(wrong_arity(&name)),
            },
            "set" => set(args).map(Command::Set),
            "del" => {
                if args.is_empty() {
                    return Err(wrong_arity(&name));
                }
                Ok(Command::Del {
                    keys: args.to_vec(),
                })
            }
            "expire" => expire(args),
            "ttl" | "pttl" => match args {
                [key] => Ok(Command::Ttl {
                    key: key.clone(),
                    unit: if name == "ttl" {
                        TtlUnit::Seconds
                    } else {
                        TtlUnit::Millis
                    },
                }),
                _ => Err(wrong_arity(&name)),
            },
            "keys" => match args {
                [pattern] => Ok(Command::Keys {
                    pattern: text(pattern),
                }),
                _ => Err(wrong_arity(&name)),
            },

            // Server commands
            "config" => self.config(frame),
            "info" => Ok(Command::Info {
                ctx: Arc::clone(&self.ctx),
                sections: args.iter().map(|s| text(s).to_ascii_lowercase()).collect(),
            }),
            "command" => Ok(Command::CommandDocs),
            "save" | "bgsave" | "lastsave" => {
                if !args.is_empty() {
                    return Err(wrong_arity(&name));
                }
                let persistence = Arc::clone(&self.ctx.persistence);
                Ok(match name.as_str() {
                    "save" => Command::Save(persistence),
                    "bgsave" => Command::BgSave(persistence),
                    _ => Command::LastSave(persistence),
                })
            }
            "replicaof" | "slaveof" => self.replica_of(&name, args),

            _ => Err(unknown_command(frame)),
        }
    }

    fn hello(&self, args: &[Bytes], origin: &Origin) -> Result<Command, CommandError> {
        let client = match origin.client() {
            Some(client) => client,
            None => return Err(CommandError::NoProto),
        };

        match args {
            [] => {}
            [version] => {
                if parse_int(version)? != crate::commands::server::PROTOCOL_VERSION {
                    return Err(CommandError::NoProto);
                }
            }
            _ => return Err(CommandError::Syntax),
        }

        let role = if self.ctx.replication.is_replica() {
            "replica"
        } else {
            "master"
        };
        Ok(Command::Hello {
            client_id: client.id(),
            role,
        })
    }

    fn config(&self, frame: &Frame) -> Result<Command, CommandError> {
        let args = frame.args();
        let subcommand = match args.first() {
            Some(subcommand) => text(subcommand).to_ascii_lowercase(),
            None => return Err(wrong_arity("config")),
        };

        match subcommand.as_str() {
            "get" => {
                let patterns: Vec<String> = args[1..]
                    .iter()
                    .map(|p| text(p).to_ascii_lowercase())
                    .collect();
                if patterns.is_empty() {
                    return Err(wrong_arity("config|get"));
                }

                let pairs = self
                    .ctx
                    .config
                    .parameters()
                    .into_iter()
                    .filter(|(name, _)| patterns.iter().any(|p| glob_match(p, name)))
                    .collect();
                Ok(Command::ConfigGet(pairs))
            }
            _ => Err(CommandError::UnknownSubcommand {
                command: "CONFIG".to_string(),
                subcommand: text(&args[0]),
            }),
        }
    }

    fn replica_of(&self, name: &str, args: &[Bytes]) -> Result<Command, CommandError> {
        let (host, port) = match args {
            [host, port] => (host, port),
            _ => return Err(wrong_arity(name)),
        };

        let master = if host.eq_ignore_ascii_case(b"no") && port.eq_ignore_ascii_case(b"one") {
            None
        } else {
            let port = std::str::from_utf8(port)
                .ok()
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or(CommandError::InvalidMasterPort)?;
            Some(MasterAddr {
                host: text(host),
                port,
            })
        };

        Ok(Command::ReplicaOf {
            ctx: Arc::clone(&self.ctx),
            master,
        })
    }
}

fn client(frame: &Frame, origin: &Origin) -> Result<Command, CommandError> {
    let args = frame.args();
    let subcommand = match args.first() {
        Some(subcommand) => text(subcommand).to_ascii_lowercase(),
        None => return Err(wrong_arity("client")),
    };
    let unknown = || CommandError::UnknownSubcommand {
        command: "CLIENT".to_string(),
        subcommand: text(&args[0]),
    };
    let client = match origin.client() {
        Some(client) => Arc::clone(client),
        None => return Err(unknown()),
    };

    match (subcommand.as_str(), &args[1..]) {
        ("id", []) => Ok(Command::ClientId(client.id())),
        ("getname", []) => Ok(Command::ClientGetName(client)),
        ("setname", [name]) => {
            // Any printable ASCII except space
            if !name.iter().all(|b| (b'!'..=b'~').contains(b)) {
                return Err(CommandError::InvalidClientName);
            }
            let name = if name.is_empty() {
                None
            } else {
                Some(text(name))
            };
            Ok(Command::ClientSetName { client, name })
        }
        ("id" | "getname" | "setname", _) => Err(wrong_arity(&format!("client|{}", subcommand))),
        _ => Err(unknown()),
    }
}

fn set(args: &[Bytes]) -> Result<SetArgs, CommandError> {
    let (key, value, options) = match args {
        [key, value, options @ ..] => (key, value, options),
        _ => return Err(wrong_arity("set")),
    };

    let mut condition = SetCondition::Always;
    let mut ttl = SetTtl::Clear;

    let mut options = options.iter();
    while let Some(option) = options.next() {
        let option = text(option).to_ascii_uppercase();
        match option.as_str() {
            "NX" | "XX" => {
                if condition != SetCondition::Always {
                    return Err(CommandError::Syntax);
                }
                condition = if option == "NX" {
                    SetCondition::IfMissing
                } else {
                    SetCondition::IfExists
                };
            }
            "EX" | "PX" => {
                if ttl != SetTtl::Clear {
                    return Err(CommandError::Syntax);
                }
                let amount = parse_int(options.next().ok_or(CommandError::Syntax)?)?;
                if amount <= 0 {
                    return Err(CommandError::InvalidExpireTime("set"));
                }
                ttl = if option == "EX" {
                    SetTtl::Seconds(amount as u64)
                } else {
                    SetTtl::Millis(amount as u64)
                };
            }
            "KEEPTTL" => {
                if ttl != SetTtl::Clear {
                    return Err(CommandError::Syntax);
                }
                ttl = SetTtl::Keep;
            }
            _ => return Err(CommandError::Syntax),
        }
    }

    Ok(SetArgs {
        key: key.clone(),
        value: value.clone(),
        condition,
        ttl,
    })
}

fn expire(args: &[Bytes]) -> Result<Command, CommandError> {
    let (key, seconds, options) = match args {
        [key, seconds, options @ ..] => (key, seconds, options),
        _ => return Err(wrong_arity("expire")),
    };
    let seconds = parse_int(seconds)?;

    let mut flags = ExpireFlags::default();
    for option in options {
        match text(option).to_ascii_uppercase().as_str() {
            "NX" => flags.nx = true,
            "XX" => flags.xx = true,
            "GT" => flags.gt = true,
            "LT" => flags.lt = true,
            _ => return Err(CommandError::Syntax),
        }
    }

    if flags.nx && (flags.xx || flags.gt || flags.lt) {
        return Err(CommandError::ExpireNxConflict);
    }
    if flags.gt && flags.lt {
        return Err(CommandError::ExpireGtLtConflict);
    }

    Ok(Command::Expire {
        key: key.clone(),
        seconds,
        flags,
    })
}

fn parse_int(arg: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CommandError::NotAnInteger)
}

fn text(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

fn wrong_arity(name: &str) -> CommandError {
    CommandError::WrongArity(name.to_string())
}

fn unknown_command(frame: &Frame) -> CommandError {
    let args = frame
        .args()
        .iter()
        .map(|arg| format!("'{}' ", String::from_utf8_lossy(arg)))
        .collect();
    CommandError::UnknownCommand {
        name: text(frame.name()),
        args,
    }
}
