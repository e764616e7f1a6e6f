use clap::{value_parser, Arg, Command};
use filter_rspamd::config::DEFAULT_CONFIG_PATH;
use filter_rspamd::{spawn_writer, Config, Filter};
use log::LevelFilter;
use std::process;
use tokio::io::BufReader;

#[tokio::main]
async fn main() {
    let matches = Command::new("filter-rspamd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("OpenSMTPD filter scanning messages with rspamd")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("url")
                .short('u')
                .long("url")
                .value_name("URL")
                .help("rspamd checkv2 endpoint, overrides the configuration file"),
        )
        .arg(
            Arg::new("max-scans")
                .long("max-scans")
                .value_name("N")
                .help("Maximum number of concurrent scans")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    // stdout carries the filter protocol, logs go to stderr
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .target(env_logger::Target::Stderr)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    if let Some(url) = matches.get_one::<String>("url") {
        config.rspamd_url = url.clone();
    }
    if let Some(max_scans) = matches.get_one::<usize>("max-scans") {
        config.max_concurrent_scans = *max_scans;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e:#}");
        process::exit(1);
    }

    if matches.get_flag("test-config") {
        println!("Configuration OK");
        println!("  rspamd_url: {}", config.rspamd_url);
        match config.timeout_seconds {
            Some(seconds) => println!("  timeout: {seconds}s"),
            None => println!("  timeout: none"),
        }
        println!("  max_concurrent_scans: {}", config.max_concurrent_scans);
        return;
    }

    let (output, writer) = spawn_writer(tokio::io::stdout());
    let mut filter = match Filter::new(&config, output) {
        Ok(filter) => filter,
        Err(e) => {
            log::error!("Failed to start filter: {e:#}");
            process::exit(1);
        }
    };

    if let Err(e) = filter.run(BufReader::new(tokio::io::stdin())).await {
        log::error!("Fatal: {e:#}");
        process::exit(1);
    }

    // let outstanding scans and decisions drain before exiting
    drop(filter);
    match writer.await {
        Ok(Ok(())) => log::info!("Shutting down"),
        Ok(Err(e)) => {
            log::error!("Failed writing to the mail agent: {e}");
            process::exit(1);
        }
        Err(e) => {
            log::error!("Output writer panicked: {e}");
            process::exit(1);
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}
