use std::any::Any;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, registry::LookupSpan};

#[doc(hidden)]
#[macro_export]
macro_rules! __log_with_context {
    ($level:ident, $result:expr, $context:expr) => {
        match $result {
            Err(e) => {
                let ae: anyhow::Error = e.into();
                let ae = ae.context($context);
                tracing::$level!(target: module_path!(), "{:#}", ae);
                Err(ae)
            }
            Ok(t) => Ok(t),
        }
    };
}

/// Adds context to the error of a `Result`, logs it at debug level and returns it.
#[macro_export]
macro_rules! log_debug {
    ($result:expr, $fmt:literal, $($arg:tt)*) => {
        $crate::__log_with_context!(debug, $result, format!($fmt, $($arg)*))
    };
    ($result:expr, $context:expr) => {
        $crate::__log_with_context!(debug, $result, $context)
    };
}

/// Adds context to the error of a `Result`, logs it as a warning and returns it.
#[macro_export]
macro_rules! log_warn {
    ($result:expr, $fmt:literal, $($arg:tt)*) => {
        $crate::__log_with_context!(warn, $result, format!($fmt, $($arg)*))
    };
    ($result:expr, $context:expr) => {
        $crate::__log_with_context!(warn, $result, $context)
    };
}

/// Adds context to the error of a `Result`, logs it as an error and returns it.
#[macro_export]
macro_rules! log_error {
    ($result:expr, $fmt:literal, $($arg:tt)*) => {
        $crate::__log_with_context!(error, $result, format!($fmt, $($arg)*))
    };
    ($result:expr, $context:expr) => {
        $crate::__log_with_context!(error, $result, $context)
    };
}

/// Renders the payload of a caught panic.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Prefixes every formatted event with the node name
struct NodeNameFormatter<T> {
    node_name: String,
    base_formatter: T,
}

impl<S, N, T> tracing_subscriber::fmt::FormatEvent<S, N> for NodeNameFormatter<T>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
    T: tracing_subscriber::fmt::FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        write!(&mut writer, "{} ", &self.node_name)?;
        self.base_formatter.format_event(ctx, writer, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingMode {
    /// Human readable logs
    Full,
    /// One JSON object per event, for log collectors
    Json,
    /// Full logs prefixed by the node name, for hosts sharing one terminal
    NodeName,
}

impl TracingMode {
    pub fn from_format(log_format: &str) -> Self {
        match log_format {
            "json" => TracingMode::Json,
            "node" => TracingMode::NodeName,
            _ => TracingMode::Full,
        }
    }
}

/// Installs the global stdout subscriber.
/// Defaults to INFO; `RUST_LOG` directives take precedence.
pub fn setup_tracing(log_format: &str, node_name: String) -> Result<()> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    let var = std::env::var("RUST_LOG").unwrap_or_default();
    if !var.contains("tokio") {
        filter = filter.add_directive("tokio=info".parse()?);
        filter = filter.add_directive("runtime=info".parse()?);
    }
    if !var.contains("opentelemetry") {
        filter = filter.add_directive("opentelemetry=warn".parse()?);
    }

    let log_layer = (match TracingMode::from_format(log_format) {
        TracingMode::Full => tracing_subscriber::fmt::layer().boxed(),
        TracingMode::Json => tracing_subscriber::fmt::layer().json().boxed(),
        TracingMode::NodeName => tracing_subscriber::fmt::layer()
            .event_format(NodeNameFormatter {
                node_name,
                base_formatter: tracing_subscriber::fmt::format(),
            })
            .boxed(),
    } as Box<dyn Layer<Registry> + Send + Sync>)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(log_layer)
        .try_init()
        .context("installing the global tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<u32, std::num::ParseIntError> {
        input.parse()
    }

    #[test_log::test]
    fn macros_add_context() {
        let ok: Result<u32> = log_warn!(parse("12"), "parsing {}", "12");
        assert_eq!(ok.unwrap(), 12);

        let err = log_error!(parse("twelve"), "parsing {}", "twelve").unwrap_err();
        assert_eq!(err.to_string(), "parsing twelve");
        let err = log_debug!(parse("x"), "plain context").unwrap_err();
        assert!(format!("{err:#}").starts_with("plain context: "));
    }

    #[test]
    fn panic_payloads() {
        let caught = std::panic::catch_unwind::<_, ()>(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static message");
        let caught = std::panic::catch_unwind::<_, ()>(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "formatted 7");
        assert_eq!(TracingMode::from_format("json"), TracingMode::Json);
        assert_eq!(TracingMode::from_format("anything"), TracingMode::Full);
    }
}
