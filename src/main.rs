use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use trunkline::{
    adapters::SystemLookup,
    config::{ProxyConfigValidator, loader::load_config_unchecked, models::ProxyConfig},
    core::{destination::Transport, resolver::DestinationResolver},
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "trunkline.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "trunkline.toml")]
        config: String,
    },
    /// Resolve a target name and print the candidate destinations as JSON
    Resolve {
        /// Configuration file providing resolver settings
        #[clap(short, long, default_value = "trunkline.toml")]
        config: String,
        /// Host name, IP literal or SIP URI to resolve
        name: String,
        /// Transport hint (udp, tcp, tls, ws, wss)
        #[clap(short, long)]
        transport: Option<String>,
        /// Explicit port (skips SRV)
        #[clap(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Commands::Validate { config } => validate_config_command(&config).await,
        Commands::Init { config } => init_config_command(&config).await,
        Commands::Resolve {
            config,
            name,
            transport,
            port,
        } => resolve_command(&config, &name, transport.as_deref(), port).await,
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ProxyConfigValidator::validate(&config) {
        Ok(()) => {
            print_summary(&config);
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Destination URIs must use the sip: or sips: scheme");
            println!("   • Preferences must lie within 0.0..=1.0");
            println!("   • Routes and trunks must reference declared trunks and error mappings");
            println!("   • Timeouts use humantime units (e.g. \"32s\", \"1m\")");
            std::process::exit(1);
        }
    }
}

fn print_summary(config: &ProxyConfig) {
    println!("✅ Configuration validation: OK");
    println!();
    println!("📋 Configuration Summary:");
    println!("   • Transaction timeout: {:?}", config.transaction_timeout());
    println!("   • Trunks: {}", config.trunks.len());
    println!("   • Routes: {}", config.routes.len());
    println!("   • Error mappings: {}", config.error_mappings.len());
    println!("   • Health Checks: {}", config.health_check.enabled);
    println!("   • Maintenance: {}", config.maintenance.enabled);
    println!();
}

/// Run the destination resolver once and print its answer
async fn resolve_command(
    config_path: &str,
    name: &str,
    transport: Option<&str>,
    port: Option<u16>,
) -> Result<()> {
    let config = if Path::new(config_path).exists() {
        load_config_unchecked(config_path).await?
    } else {
        ProxyConfig::default()
    };
    tracing_setup::init_from_config(&config.logging)?;

    let transport = transport
        .map(|t| t.parse::<Transport>())
        .transpose()
        .map_err(|e| eyre!("{e}"))?;

    let lookup = Arc::new(SystemLookup::from_static(&config.resolver.static_records));
    let resolver = DestinationResolver::new(lookup, &config.resolver);

    if !resolver.should_search(name) {
        tracing::info!(name, "Target is a literal address, no lookup needed");
    }

    let destinations = resolver
        .resolve(name, transport, port)
        .await
        .wrap_err_with(|| format!("Failed to resolve {name}"))?;

    let json = serde_json::to_string_pretty(&destinations).context("Failed to encode destinations")?;
    println!("{json}");
    Ok(())
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Trunkline proxy core configuration

[transaction]
timeout = "32s"
ingress_buffer = 1024

[resolver]
timeout_ms = 2000
attempts = 2
cache_ttl_secs = 60
supported_transports = ["udp", "tcp", "tls"]

[health_check]
enabled = true
interval_secs = 30
timeout_secs = 2
stale_after_secs = 3600

[maintenance]
enabled = false
status_code = 503
reason = "Service Unavailable"

[logging]
level = "info"
json = false

# Trunk with a fixed server group
[trunks.pstn]
error_mapping = "carrier"

[trunks.pstn.target]
type = "static"
destinations = [
    { uri = "sip:10.0.0.1:5060", preference = 1.0 },
    { uri = "sip:10.0.0.2:5060", preference = 0.5 },
]

[trunks.pstn.normalization.request_headers]
remove = ["X-Internal"]

# Trunk resolved through SRV / address records
# [trunks.carrier]
# failover_codes = [500, 502, 503, 504]
# [trunks.carrier.target]
# type = "resolve"
# name = "carrier.example.com"
# transport = "tcp"

[[routes]]
pattern = '^sips?:\+'
trunk = "pstn"
methods = ["INVITE"]

[[error_mappings]]
name = "carrier"
rules = [
    { codes = [502, 504], code = 503, phrase = "Service Unavailable" },
]
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'trunkline validate --config {config_path}' to check it");
    Ok(())
}
