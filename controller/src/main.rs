//! GitOps reconciler - Entry Point
//!
//! Accepts deployment intents over HTTP and reconciles them across the
//! manifest repository, the CD application registry and the service catalog.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use reconciler::app::options::AppOptions;
use reconciler::app::run::run;
use reconciler::filesys::file::File;
use reconciler::logs::{init_logging, LogLevel, LogOptions};
use reconciler::storage::layout::StorageLayout;
use reconciler::storage::settings::Settings;
use reconciler::stores::memory::{InMemoryCatalog, InMemoryManifestStore, InMemoryRegistry};
use reconciler::stores::Collaborators;
use reconciler::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Retrieve the settings file
    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(PathBuf::from(path)),
        None => layout.settings_file(),
    };
    let settings = match Settings::load(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {}", e);
            return;
        }
    };

    // Initialize logging
    let log_level = match cli_args.get("log-level").map(|l| l.parse::<LogLevel>()) {
        Some(Ok(level)) => level,
        Some(Err(e)) => {
            eprintln!("{}, falling back to {:?}", e, settings.log_level);
            settings.log_level.clone()
        }
        None => settings.log_level.clone(),
    };
    let log_options = LogOptions {
        log_level,
        json_format: settings.json_logs || cli_args.contains_key("json-logs"),
        log_dir: settings.log_to_file.then(|| layout.logs_dir()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Transport clients for the real collaborators are wired outside this
    // binary; standalone it reconciles against in-memory stores
    warn!("No remote collaborators configured, using in-memory stores");
    let collaborators = Collaborators::new(
        Arc::new(InMemoryManifestStore::new()),
        Arc::new(InMemoryRegistry::new()),
        Arc::new(InMemoryCatalog::new()),
    );

    let options = AppOptions::from_settings(&settings, layout);
    info!("Running GitOps reconciler with options: {:?}", options);
    let result = run(version.version, options, collaborators, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the reconciler: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
