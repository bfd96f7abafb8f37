//! bibsync - shared bibliographies for groups of authors.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bibsync::{
    api::{self, ApiState},
    auth::Authorizer,
    client::{sync_bibliography, Action, HttpRemote, PromptResolver, SyncOptions, SyncReport},
    policy::{AcceptAll, PolicyGate, RequiredFields},
    realm::config::{DEFAULT_BIB_FILE, DEFAULT_REALM},
    Library, ServerConfig,
};

/// Shared bibliography server and client.
#[derive(Parser)]
#[command(name = "bibsync", version, about = "Shared bibliographies for groups of authors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where and as whom a client command talks.
#[derive(Args)]
struct RemoteArgs {
    /// bibsync server URL.
    #[arg(long, env = "BIBSYNC_SERVER", default_value = "http://localhost:8780")]
    server: String,

    /// Access token.
    #[arg(long, env = "BIBSYNC_TOKEN", conflicts_with = "token_file")]
    token: Option<String>,

    /// File holding the access token.
    #[arg(long, env = "BIBSYNC_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Realm to work in; the server's default when omitted.
    #[arg(long, env = "BIBSYNC_REALM")]
    realm: Option<String>,
}

impl RemoteArgs {
    fn remote(&self) -> Result<HttpRemote> {
        let token = match (&self.token, &self.token_file) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(path)) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading token file {}", path.display()))?
                    .trim()
                    .to_string(),
            ),
            (None, None) => None,
        };
        Ok(HttpRemote::new(&self.server, self.realm.clone(), token))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API daemon.
    Daemon {
        /// Address to bind the API server.
        #[arg(long, default_value = "0.0.0.0:8780", env = "BIBSYNC_BIND")]
        bind: String,

        /// Directory holding one subdirectory per realm.
        #[arg(long, env = "BIBSYNC_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Bibliography file name inside each realm.
        #[arg(long, env = "BIBSYNC_BIB_FILE", default_value = DEFAULT_BIB_FILE)]
        bib_file: String,

        /// Realm for requests that name none.
        #[arg(long, env = "BIBSYNC_DEFAULT_REALM", default_value = DEFAULT_REALM)]
        default_realm: String,

        /// Ignore token tables and grant every request.
        #[arg(long, env = "BIBSYNC_NO_AUTH")]
        no_auth: bool,

        /// Write bibliography files without committing them.
        #[arg(long, env = "BIBSYNC_NO_COMMIT")]
        no_commit: bool,

        /// Commit without pushing.
        #[arg(long, env = "BIBSYNC_NO_PUSH")]
        no_push: bool,

        /// Reject new or replaced entries lacking this field (repeatable).
        #[arg(long = "require-field", value_name = "FIELD")]
        require_fields: Vec<String>,

        /// Where clients can get a build matching this server.
        #[arg(long, env = "BIBSYNC_CLIENT_URL", default_value = "https://crates.io/crates/bibsync")]
        client_url: String,
    },

    /// Sync a local bibliography with the server for a set of keys.
    Get {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Local bibliography.
        #[arg(long, env = "BIBSYNC_BIB", default_value = DEFAULT_BIB_FILE)]
        bib: PathBuf,

        /// File listing citation keys, one per line.
        #[arg(long)]
        keys_file: Option<PathBuf>,

        /// Ask the server to skip its policy gate.
        #[arg(long)]
        force: bool,

        /// Sync even if nothing changed since the last run.
        #[arg(long)]
        always: bool,

        /// Citation keys.
        keys: Vec<String>,
    },

    /// Search the server and print matching entries as BibTeX.
    Search {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Whitespace-separated terms, each at least three characters.
        #[arg(required = true)]
        query: Vec<String>,
    },

    /// Ask the server to reload a realm from its repository.
    Sync {
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Show daemon status.
    Status {
        /// bibsync server URL.
        #[arg(long, env = "BIBSYNC_SERVER", default_value = "http://localhost:8780")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bibsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            bind,
            data_dir,
            bib_file,
            default_realm,
            no_auth,
            no_commit,
            no_push,
            require_fields,
            client_url,
        } => {
            let mut config = match data_dir {
                Some(dir) => ServerConfig::new(dir),
                None => ServerConfig::default(),
            }
            .with_bib_file(bib_file)
            .with_default_realm(default_realm);
            if no_commit {
                config = config.without_commit();
            }
            if no_push {
                config = config.without_push();
            }

            let authorizer = if no_auth {
                Authorizer::disabled()
            } else {
                Authorizer::new()
            };
            let policy: Arc<dyn PolicyGate> = if require_fields.is_empty() {
                Arc::new(AcceptAll)
            } else {
                Arc::new(RequiredFields::new(require_fields))
            };

            run_daemon(&bind, config, authorizer, policy, client_url).await?;
        }

        Commands::Get {
            remote,
            bib,
            keys_file,
            force,
            always,
            mut keys,
        } => {
            if let Some(path) = keys_file {
                keys.extend(read_keys(&path)?);
            }
            let options = SyncOptions { keys, force, always };
            run_get(&remote.remote()?, &bib, &options).await?;
        }

        Commands::Search { remote, query } => {
            let found = remote.remote()?.search(&query.join(" ")).await?;
            print!("{}", found);
        }

        Commands::Sync { remote } => {
            let answer = remote.remote()?.resync().await?;
            println!("{}", answer);
        }

        Commands::Status { server } => {
            show_status(&server).await?;
        }
    }

    Ok(())
}

/// Run the API daemon.
async fn run_daemon(
    bind: &str,
    config: ServerConfig,
    authorizer: Authorizer,
    policy: Arc<dyn PolicyGate>,
    client_url: String,
) -> Result<()> {
    tracing::info!(
        data_dir = %config.data_dir.display(),
        default_realm = %config.default_realm,
        authorization = authorizer.is_enabled(),
        commit = config.commit,
        push = config.push,
        "Starting bibsync daemon"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    let library = Library::new(config, authorizer, policy);
    let state = Arc::new(ApiState::new(library, client_url));

    api::serve(state, bind).await?;

    Ok(())
}

/// Keys listed one per line; blank lines and `#` comments are skipped.
fn read_keys(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut keys = Vec::new();
    for line in io::BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            keys.push(line.to_string());
        }
    }
    Ok(keys)
}

/// Sync and print what happened.
async fn run_get(remote: &HttpRemote, bib: &Path, options: &SyncOptions) -> Result<()> {
    let stdin = io::stdin();
    let mut resolver = PromptResolver::new(stdin.lock(), io::stdout());

    let report = sync_bibliography(remote, bib, options, &mut resolver)
        .await
        .with_context(|| format!("syncing {} with {}", bib.display(), remote.base()))?;

    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    if report.skipped {
        println!("Nothing changed since the last sync.");
        return;
    }

    if !report.pushed.is_empty() {
        println!("Added to the server: {}", report.pushed.join(", "));
    }
    for rejection in &report.rejected {
        println!("Rejected by the server: {} ({})", rejection.record.id(), rejection.reason);
    }
    for action in &report.actions {
        match action {
            Action::PushedLocal(id) => println!("Replaced {} on the server", id),
            Action::PulledRemote(id) => println!("Replaced {} locally", id),
            Action::CommittedLocal(id) => println!("Added {} to the server", id),
            Action::DeletedRemote(id) => println!("Deleted {} from the server", id),
            Action::DeletedLocal(id) => println!("Deleted {} locally", id),
            Action::Ignored(_) => {}
            Action::Refused { id, reason } => println!("Server refused change to {}: {}", id, reason),
        }
    }

    if report.aborted {
        println!("Aborted; the local bibliography was not rewritten.");
        return;
    }

    if !report.pulled.is_empty() {
        println!("Fetched: {}", report.pulled.join(", "));
    }
    for unresolved in &report.unresolved {
        if unresolved.suggestions.is_empty() {
            println!("Unknown key {}", unresolved.key);
        } else {
            let names: Vec<String> = unresolved
                .suggestions
                .iter()
                .map(|s| format!("{} ({:.2})", s.record.id(), s.score))
                .collect();
            println!("Unknown key {}; did you mean: {}", unresolved.key, names.join(", "));
        }
    }
}

/// Show daemon status via API.
async fn show_status(server: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/status", bibsync::client::api_base(server));

    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to get status: {}", response.status());
    }

    let status: serde_json::Value = response.json().await?;

    println!("bibsync status");
    println!("==============");
    println!("Status:  {}", status["status"]);
    println!("Version: {}", status["version"]);
    println!("Realms:  {}", status["realms"]);

    Ok(())
}
