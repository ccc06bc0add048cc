//! Log output goes to stderr, except while the terminal UI owns the screen:
//! then it is held in memory and written out once the UI has exited.

use std::io::{self, Write};
use std::sync::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static HELD: Mutex<Option<Vec<u8>>> = Mutex::new(None);

pub fn init(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), level))
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(GatedStderr))
        .init();
}

#[derive(Clone, Copy)]
struct GatedStderr;

impl<'a> MakeWriter<'a> for GatedStderr {
    type Writer = GatedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        GatedWriter
    }
}

struct GatedWriter;

impl Write for GatedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut held) = HELD.lock() {
            if let Some(buffer) = held.as_mut() {
                buffer.extend_from_slice(buf);
                return Ok(buf.len());
            }
        }
        io::stderr().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// Holds log output until dropped.
pub struct Hold(());

pub fn hold() -> Hold {
    if let Ok(mut held) = HELD.lock() {
        held.get_or_insert_with(Vec::new);
    }
    Hold(())
}

impl Drop for Hold {
    fn drop(&mut self) {
        let bytes = HELD.lock().ok().and_then(|mut held| held.take());
        if let Some(bytes) = bytes {
            let _ = io::stderr().write_all(&bytes);
        }
    }
}
