use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

use socksfleet::{FleetOptions, Rule, RuleStore};

/// SOCKS5 authentication credentials for one rule
#[derive(Debug, Clone, Args)]
pub struct Auths {
    /// Username clients must present (ignored with --no-auth)
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Password clients must present (ignored with --no-auth)
    #[arg(short = 'P', long)]
    pub password: Option<String>,
}

/// Settings of a rule, shared by `add` and `update`
#[derive(Debug, Clone, Args)]
pub struct RuleArgs {
    /// Display name
    #[arg(short, long, default_value = "")]
    pub name: String,

    /// TCP port the instance listens on
    #[arg(short, long)]
    pub port: u16,

    #[command(flatten)]
    pub auth: Auths,

    /// Accept clients without authentication
    #[arg(long)]
    pub no_auth: bool,

    /// Allow UDP ASSOCIATE
    #[arg(long = "udp")]
    pub enable_udp: bool,
}

impl RuleArgs {
    pub fn into_rule(self, id: String) -> Rule {
        Rule {
            id,
            name: self.name,
            port: self.port,
            username: self.auth.username.unwrap_or_default(),
            password: self.auth.password.unwrap_or_default(),
            no_auth: self.no_auth,
            enable_udp: self.enable_udp,
            ..Rule::default()
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print every rule with its traffic totals
    List,

    /// Add a rule (stopped)
    Add {
        /// Explicit id; `rule_<n>` is assigned when omitted
        #[arg(long)]
        id: Option<String>,

        #[command(flatten)]
        rule: RuleArgs,
    },

    /// Replace a rule's settings, keeping its traffic totals
    Update {
        id: String,

        #[command(flatten)]
        rule: RuleArgs,
    },

    /// Remove a rule
    Delete { id: String },

    /// Print a rule's (upload, download) totals
    Stats { id: String },

    /// Zero a rule's traffic totals
    Reset { id: String },

    /// Serve rules until Ctrl-C
    Run {
        /// Start every configured rule
        #[arg(long, conflicts_with = "start")]
        all: bool,

        /// Rule ids to start
        #[arg(long = "start", value_name = "ID")]
        start: Vec<String>,
    },
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Fleet of independently configured SOCKS5 servers",
    long_about = "socksfleet manages SOCKS5 server instances (rules), each with its own port, auth mode and UDP setting.\n\nTraffic through every instance is counted and stored with the rule.\n"
)]
pub struct Cli {
    /// Rules file (default: socksfleet_rules.json next to the executable)
    #[arg(long, global = true, value_name = "PATH")]
    pub rules_file: Option<PathBuf>,

    /// IP address the rule listeners bind to
    #[arg(long, global = true, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn store(&self) -> RuleStore {
        match &self.rules_file {
            Some(path) => RuleStore::new(path),
            None => RuleStore::beside_executable(),
        }
    }

    pub fn fleet_options(&self) -> FleetOptions {
        FleetOptions {
            listen_ip: self.listen_ip,
        }
    }
}
