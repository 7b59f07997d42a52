use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use webmail_server::config::{self, Config, PreloadConfig, PreloadMail};
use webmail_server::test_utils::{demo_account, generate_fake_mails_with_seed};
use webmail_server::{Account, AccountManager, AppState, HttpServer, MailSender, MailStore, MailTransport};

/// Log sink writing every record to stdout and to the log file
struct DualWriter {
    file: File,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize logger
    let mut logger_builder = env_logger::Builder::from_default_env();
    logger_builder.filter_level(
        config
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info),
    );

    // Configure file logging (default to webmail.log if not specified)
    let log_file_path = config
        .log_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("webmail.log"));
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&log_file_path)
        .map_err(|e| anyhow::anyhow!("Failed to open log file {:?}: {}", log_file_path, e))?;

    logger_builder.target(env_logger::Target::Pipe(Box::new(DualWriter { file })));
    println!("Logging to file: {:?}", log_file_path);

    logger_builder.init();

    info!("Starting webmail server");
    let redacted = Config {
        smtp_password: config.smtp_password.as_ref().map(|_| "[REDACTED]".to_string()),
        ..config.clone()
    };
    info!("Configuration: {:?}", redacted);

    let store = Arc::new(MailStore::with_session_ttl(chrono::Duration::hours(config.session_ttl_hours)));
    let mut accounts = AccountManager::new();
    let mut preload = PreloadConfig::default();

    if let Some(preload_path) = &config.preload {
        info!("Preloading from {:?}", preload_path);
        preload = config::load_preload(preload_path)?;
    }

    // Generate fake mails if requested
    if let Some(count) = config.generate_fake_mails {
        let demo = demo_account();
        info!("Generating {} fake mails for '{}' with seed {}", count, demo.name, config.seed);
        let mails = generate_fake_mails_with_seed(&demo, count, Some(config.seed))?;
        preload.accounts.push(config::PreloadAccount {
            name: demo.name.clone(),
            address: demo.address.clone(),
            password_hash: Some(demo.password_hash.clone()),
            password: None,
        });
        preload.mails.extend(mails.iter().map(PreloadMail::from_mail));

        if let Some(output_path) = &config.output_preload {
            info!("Writing generated data to {:?}", output_path);
            match config::write_preload(&preload, output_path) {
                Ok(_) => info!("Successfully wrote {:?}", output_path),
                Err(e) => warn!("Failed to write generated data: {}", e),
            }
        }
    }

    for account in preload.accounts {
        accounts.add(Account::try_from(account)?);
    }
    for preload_mail in &preload.mails {
        if accounts.get(&preload_mail.account).is_none() {
            warn!("Skipping mail of unknown account '{}'", preload_mail.account);
            continue;
        }
        match preload_mail.to_mail() {
            Ok(mail) => {
                store.store_mail(mail).await;
            }
            Err(e) => warn!("Skipping unparseable mail: {}", e),
        }
    }
    for contact in preload.contacts {
        store.add_contact(&contact.account, contact.contact).await;
    }
    info!("Loaded {} account(s) and {} mail(s)", accounts.len(), store.count().await);
    if accounts.is_empty() {
        warn!("No account configured, nobody can log in. Use --preload or --generate-fake-mails");
    }

    let transport = match config.relay_settings()? {
        Some(relay) => {
            info!("Outgoing mail goes through {}:{} ({:?})", relay.host, relay.port, relay.security);
            MailTransport::relay(&relay)?
        }
        None => {
            warn!("No SMTP relay configured, outgoing mails are only recorded");
            MailTransport::stub()
        }
    };
    let sender = MailSender::new(store.clone(), transport);
    let state = Arc::new(AppState::new(store, accounts, sender));

    // Start HTTP server
    let server = HttpServer::new(config.socket_addr(), state, config.http_options());
    let addr = server.addr();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            eprintln!("HTTP server error: {}", e);
        }
    });

    info!("Webmail server running on http://{}", addr);
    info!("Press Ctrl+C to stop.");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
        }
        Err(err) => {
            warn!("Unable to listen for shutdown signal: {}", err);
        }
    }

    http_handle.abort();

    info!("Shutdown complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dual_writer_copies_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webmail.log");
        let mut writer = DualWriter {
            file: File::create(&path).unwrap(),
        };

        writer.write_all(b"[HTTP] listening\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[HTTP] listening\n");
    }
}
