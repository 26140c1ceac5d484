use std::{str::FromStr, sync::Mutex};

use tracing_subscriber::{filter::LevelFilter, prelude::*, util::SubscriberInitExt, Registry};

use super::error::Error;

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            level: "info".to_string(),
            format: "plain".to_string(),
            file: None,
        }
    }
}

pub fn prepare_tracing(conf: TraceConfig) -> Result<(), Error> {
    let level =
        LevelFilter::from_str(&conf.level).map_err(|_| Error::InvalidLevel(conf.level.clone()))?;

    let file_layer = match conf.file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    if conf.format == "json" {
        Registry::default()
            .with(file_layer)
            .with(tracing_subscriber::fmt::Layer::new().with_ansi(true).json())
            .with(level)
            .try_init()?;
    } else {
        Registry::default()
            .with(file_layer)
            .with(tracing_subscriber::fmt::Layer::new().with_ansi(true))
            .with(level)
            .try_init()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_invalid_level() {
        let conf = TraceConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(prepare_tracing(conf), Err(Error::InvalidLevel(_))));
    }
}
