use std::net::SocketAddr;

use clap::{Parser, Subcommand};

/// tokengate: forward-auth gate for host/path scoped access tokens
#[derive(Parser)]
#[command(name = "tokengate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the admin and forward-auth listeners
    Serve {
        /// Admin API address (overrides ADMIN_BIND)
        #[arg(long)]
        admin_bind: Option<SocketAddr>,
        /// Forward-auth address (overrides AUTH_BIND)
        #[arg(long)]
        auth_bind: Option<SocketAddr>,
    },

    /// Manage tokens directly against the store
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create a token and print its secret
    Create {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "")]
        label: String,
        /// Host glob, empty matches any host
        #[arg(long, default_value = "")]
        host: String,
        /// Path glob, empty matches any path
        #[arg(long, default_value = "")]
        path: String,
        /// Injected header as NAME=VALUE, repeatable
        #[arg(long = "header", value_name = "NAME=VALUE")]
        headers: Vec<String>,
    },
    /// List a user's tokens
    List {
        #[arg(long)]
        user: String,
    },
    /// Issue a new secret for a token
    Rotate {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: i64,
    },
    /// Delete a token
    Delete {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: i64,
    },
}
