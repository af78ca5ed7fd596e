use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use omclient::config;
use omclient::om::{Access, ObjectAttributes, ObjectClient};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "omctl")]
#[command(version, about = "Store, resolve, fetch and delete objects on an object manager server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to OM_SERVER_URL / OM_SECRET_KEY)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Profile to use from config
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable SSL certificate verification
    #[arg(long, global = true)]
    insecure: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file and print its object id
    Store {
        /// Collection name ([a-z0-9_-]+)
        collection: String,

        /// File to upload
        file: PathBuf,

        /// Access level: public or protected
        #[arg(long)]
        access: Option<Access>,

        /// Override the MIME type
        #[arg(long)]
        mime_type: Option<String>,

        /// Cache age in seconds (public objects)
        #[arg(long)]
        cache_age: Option<u64>,

        /// URL lifetime in seconds (protected objects)
        #[arg(long)]
        ttl: Option<u64>,

        /// Extra attribute passed through to the server (key=value)
        #[arg(long = "attr", value_parser = parse_key_value)]
        attrs: Vec<(String, String)>,
    },

    /// Delete an object
    Delete {
        /// Object id
        id: String,
    },

    /// Print the accessible URL of an object
    Url {
        /// Object id
        id: String,
    },

    /// Download an object and print the written path
    Fetch {
        /// Object id
        id: String,

        /// Destination path (a temporary file when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the redirect a web handler would send for an object
    Redirect {
        /// Object id
        id: String,
    },
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // One sequential round trip per command
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())?;
    let client_config = config
        .client_config(cli.profile.as_deref())?
        .with_insecure_tls(cli.insecure || config.http.insecure_tls);
    debug!(config = ?client_config, "loaded configuration");

    let client = ObjectClient::from_config(&client_config)
        .context("Failed to create object manager client")?;

    match cli.command {
        Commands::Store {
            collection,
            file,
            access,
            mime_type,
            cache_age,
            ttl,
            attrs,
        } => {
            let mut attributes = ObjectAttributes::new();
            for (key, value) in attrs {
                attributes = attributes.with_extra(key, value);
            }
            attributes.access = access;
            attributes.mime_type = mime_type;
            attributes.cache_age = cache_age;
            attributes.ttl = ttl;

            let object_id = client
                .store(&collection, &file, &attributes)
                .await
                .context(format!("Failed to store {:?}", file))?;
            println!("{}", object_id);
        }
        Commands::Delete { id } => {
            if !client.delete(&id).await? {
                anyhow::bail!("Server refused to delete object '{}'", id);
            }
        }
        Commands::Url { id } => {
            let url = client
                .resolve_url(&id)
                .await
                .context(format!("Failed to resolve object '{}'", id))?;
            println!("{}", url);
        }
        Commands::Fetch { id, output } => {
            let path = client
                .fetch(&id, output.as_deref())
                .await
                .context(format!("Failed to fetch object '{}'", id))?;
            println!("{}", path.display());
        }
        Commands::Redirect { id } => {
            let redirect = client.stream(&id).await;
            println!("{}", redirect.status.as_u16());
            if let Some(location) = redirect.location {
                println!("Location: {}", location);
            }
        }
    }

    Ok(())
}
