// src/infra/logger.rs — Structured logging with tracing

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging(level: &str) {
    // stdout carries command output (final prompt, --json status)
    // try_init: integration tests and embedded callers may have installed one already
    let _ = subscriber(level, std::io::stderr).try_init();
}

fn subscriber<W>(level: &str, writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .compact()
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_events_go_to_the_given_writer() {
        let captured = Captured::default();
        let sink = captured.clone();
        let sub = subscriber("info", move || sink.clone());
        tracing::subscriber::with_default(sub, || {
            tracing::warn!(iteration_id = "it-1", "Retrying after error");
        });
        let text = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("Retrying after error"));
        assert!(text.contains("it-1"));
    }
}
