pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    use crate::config::env_truthy;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        Warn,
        #[default]
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }
        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let env_filter = build_env_filter(config.level.to_filter());

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        if let Ok(filter) = std::env::var("HUDDLE_LOG_FILTER") {
            return EnvFilter::new(filter);
        }
        EnvFilter::new(default_filter_for(level, env_truthy("HUDDLE_TRACE_DEPS")))
    }

    // webrtc-rs logs every STUN binding and SCTP chunk at trace level.
    const NOISY_DEP_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_srtp",
        "webrtc_mdns",
        "tokio_tungstenite",
        "tungstenite",
    ];

    pub(crate) fn default_filter_for(level: LevelFilter, allow_dep_traces: bool) -> String {
        let mut filter = match level {
            LevelFilter::TRACE => "info,huddle_core=trace,huddle=trace".to_owned(),
            LevelFilter::DEBUG => "info,huddle_core=debug,huddle=debug".to_owned(),
            other => other.to_string().to_ascii_lowercase(),
        };
        if level == LevelFilter::TRACE && !allow_dep_traces {
            for target in NOISY_DEP_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=info");
            }
        }
        filter
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn trace_level_throttles_webrtc_internals() {
            let filter = default_filter_for(LevelFilter::TRACE, false);
            assert!(filter.starts_with("info,huddle_core=trace"));
            assert!(filter.contains("webrtc_ice=info"));

            let unthrottled = default_filter_for(LevelFilter::TRACE, true);
            assert!(!unthrottled.contains("webrtc_ice"));
        }

        #[test]
        fn plain_levels_pass_through() {
            assert_eq!(default_filter_for(LevelFilter::WARN, false), "warn");
            assert_eq!(default_filter_for(LevelFilter::INFO, false), "info");
        }
    }
}
