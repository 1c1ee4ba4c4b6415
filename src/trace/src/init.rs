use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Registry};

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file: {0}")]
    LogFile(#[source] std::io::Error),

    #[error("failed to install global subscriber: {0}")]
    Init(#[source] tracing_subscriber::util::TryInitError),
}

pub fn prepare_tracing(conf: TraceConfig) -> Result<(), Error> {
    let level =
        LevelFilter::from_str(&conf.level).map_err(|_| Error::InvalidLevel(conf.level.clone()))?;
    let json = conf.format == "json";

    // A log file receives the same records as the console, without colors.
    let file_layer = match conf.file {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(Error::LogFile)?;
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .with_ansi(false)
                    .with_writer(file),
            )
        }
        None => None,
    };

    if json {
        Registry::default()
            .with(file_layer)
            .with(tracing_subscriber::fmt::Layer::new().json())
            .with(level)
            .try_init()
            .map_err(Error::Init)
    } else {
        Registry::default()
            .with(file_layer)
            .with(tracing_subscriber::fmt::Layer::new().with_ansi(true))
            .with(level)
            .try_init()
            .map_err(Error::Init)
    }
}

#[cfg(test)]
mod tests {
    use super::{prepare_tracing, Error, TraceConfig};

    #[test]
    fn reject_unknown_level() {
        let res = prepare_tracing(TraceConfig {
            level: "loud".to_string(),
            ..Default::default()
        });
        assert!(matches!(res, Err(Error::InvalidLevel(_))));
    }
}
