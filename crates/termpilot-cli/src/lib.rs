use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "termpilot",
    version,
    about = "SSH session manager with an AI command assistant"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Extra config file applied on top of the user and project config.
    #[arg(long, global = true)]
    pub config: Option<String>,
}

/// How to authenticate against an ad-hoc target. The password itself is read
/// from `TERMPILOT_PASSWORD`.
#[derive(Args, Debug, Clone, Default)]
pub struct AuthArgs {
    #[arg(long, short = 'i')]
    pub identity: Option<PathBuf>,

    #[arg(long)]
    pub password: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive session: lines run on the server, `? ...` asks the assistant.
    Connect {
        /// `user@host[:port]` or the name of a saved session.
        target: String,
        #[command(flatten)]
        auth: AuthArgs,
    },
    Exec {
        target: String,
        #[command(flatten)]
        auth: AuthArgs,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    Monitor {
        target: String,
        #[command(flatten)]
        auth: AuthArgs,
        #[arg(long, default_value_t = 5)]
        samples: u32,
    },
    Ask {
        target: String,
        #[command(flatten)]
        auth: AuthArgs,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        question: Vec<String>,
    },
    Sessions {
        #[command(subcommand)]
        command: SessionCommand,
    },
    Config {
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    List,
    Add {
        name: String,
        target: String,
        #[command(flatten)]
        auth: AuthArgs,
    },
    Remove {
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_collects_the_remaining_words() {
        let cli = Cli::try_parse_from(["termpilot", "exec", "ops@web:2222", "df", "-h", "/"]).unwrap();
        match cli.command {
            Command::Exec {
                target, command, ..
            } => {
                assert_eq!(target, "ops@web:2222");
                assert_eq!(command, vec!["df", "-h", "/"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn saved_sessions_take_auth_flags() {
        let cli = Cli::try_parse_from([
            "termpilot",
            "sessions",
            "add",
            "web",
            "deploy@10.0.0.5",
            "-i",
            "/home/me/.ssh/id_ed25519",
        ])
        .unwrap();
        match cli.command {
            Command::Sessions {
                command: SessionCommand::Add { name, auth, .. },
            } => {
                assert_eq!(name, "web");
                assert_eq!(
                    auth.identity,
                    Some(PathBuf::from("/home/me/.ssh/id_ed25519"))
                );
                assert!(!auth.password);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn monitor_defaults_to_five_samples() {
        let cli = Cli::try_parse_from(["termpilot", "monitor", "web", "--config", "x.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("x.toml"));
        assert!(matches!(cli.command, Command::Monitor { samples: 5, .. }));
    }
}
