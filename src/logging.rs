use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Tees formatted log lines into a broadcast channel so the gateway can
/// stream daemon logs to connected control peers, while still writing to
/// stdout.
#[derive(Clone)]
pub struct BroadcastMakeWriter {
    pub sender: tokio::sync::broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for BroadcastMakeWriter {
    type Writer = BroadcastWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BroadcastWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub struct BroadcastWriter {
    sender: tokio::sync::broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl std::io::Write for BroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf).to_string();
        let _ = self.sender.send(line); // Ignored if no receivers
        if !self.suppress_stdout {
            std::io::stdout().write(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. Returns the log-line broadcast sender
/// for the gateway's `logs` event stream.
pub fn init_logging(suppress_stdout: bool) -> tokio::sync::broadcast::Sender<String> {
    let (sender, _) = tokio::sync::broadcast::channel(256);
    let writer = BroadcastMakeWriter {
        sender: sender.clone(),
        suppress_stdout,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
    sender
}
