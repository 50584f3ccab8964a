use tracing_subscriber::fmt::MakeWriter;

/// Mirrors every formatted log line onto a broadcast channel so the
/// `/api/logs` SSE endpoint can stream them, while still writing to stdout.
#[derive(Clone)]
pub(crate) struct FanoutMakeWriter {
    pub sender: tokio::sync::broadcast::Sender<String>,
}

impl<'a> MakeWriter<'a> for FanoutMakeWriter {
    type Writer = FanoutWriter;

    fn make_writer(&'a self) -> Self::Writer {
        FanoutWriter {
            sender: self.sender.clone(),
        }
    }
}

pub(crate) struct FanoutWriter {
    sender: tokio::sync::broadcast::Sender<String>,
}

impl std::io::Write for FanoutWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf).to_string();
        let _ = self.sender.send(msg); // Ignored if no receivers
        std::io::stdout().write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}

/// Installs the global subscriber. Returns the sender handed to `AppState`
/// for the log stream endpoint.
pub(crate) fn init() -> tokio::sync::broadcast::Sender<String> {
    let (log_tx, _) = tokio::sync::broadcast::channel(256);
    let writer = FanoutMakeWriter {
        sender: log_tx.clone(),
    };

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(writer)
        .init();

    log_tx
}
