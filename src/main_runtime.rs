use hedgesync::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Console logging plus a daily rolling file when the log directory is writable.
///
/// `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hedgesync=debug,sqlx=warn", config.level))
    });

    let log_dir = std::env::var("HEDGESYNC_LOG_DIR")
        .ok()
        .or_else(|| config.dir.clone());

    // `rolling::daily` aborts the process if it cannot create the file, so
    // writability is checked first.
    let file_layer = log_dir.as_deref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: Could not create log directory {} ({}), file logging disabled", dir, e);
            return None;
        }
        let probe = std::path::Path::new(dir).join(".hedgesync_write_test");
        if let Err(e) = std::fs::OpenOptions::new().create(true).append(true).open(&probe) {
            eprintln!("Warning: Could not write to log directory {} ({}), file logging disabled", dir, e);
            return None;
        }
        let _ = std::fs::remove_file(&probe);

        let file_appender = tracing_appender::rolling::daily(dir, "hedgesync.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Lives for the whole process
        Box::leak(Box::new(guard));

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });
    let file_logging_enabled = file_layer.is_some();

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/hedgesync.log", dir);
    }
}

pub fn init_logging_simple() {
    // Operator commands print JSON on stdout; keep logs to warnings
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .try_init();
}
