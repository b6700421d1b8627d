use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

pub const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct TraceConfig {
    // A level or an env-filter directive such as `info,kube=warn`
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            level: DEFAULT_LEVEL.to_string(),
            format: "plain".to_string(),
            file: None,
        }
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("invalid log level {level}: {e}, fallback to {DEFAULT_LEVEL}");
        EnvFilter::new(DEFAULT_LEVEL)
    })
}

// Installing twice is not an error so that tests can call this repeatedly.
pub async fn prepare_tracing(conf: TraceConfig) {
    let file = conf.file.as_ref().and_then(|path| match std::fs::File::create(path) {
        Ok(f) => Some(std::sync::Arc::new(f)),
        Err(e) => {
            eprintln!("failed to create log file {path}: {e}");
            None
        }
    });
    // The file layer's type depends on the subscriber stack, so it is built per branch.
    macro_rules! file_layer {
        () => {
            file.map(|f| fmt::Layer::new().with_ansi(false).with_writer(f))
        };
    }

    let res = if conf.format == "json" {
        Registry::default()
            .with(filter(&conf.level))
            .with(fmt::Layer::new().json())
            .with(file_layer!())
            .try_init()
    } else {
        Registry::default()
            .with(filter(&conf.level))
            .with(fmt::Layer::new().with_ansi(true))
            .with(file_layer!())
            .try_init()
    };
    if let Err(e) = res {
        tracing::debug!(error = e.to_string(), "tracing subscriber is already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn works_filter() {
        assert_eq!(
            filter("debug").max_level_hint(),
            Some(tracing_subscriber::filter::LevelFilter::DEBUG)
        );
        assert_eq!(
            filter("warn,portd=trace").max_level_hint(),
            Some(tracing_subscriber::filter::LevelFilter::TRACE)
        );
    }
}
