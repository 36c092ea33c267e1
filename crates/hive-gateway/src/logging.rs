//! Log output with secret redaction applied to every line before it leaves
//! the process.

use std::io::{self, Write};

use tracing_subscriber::fmt::MakeWriter;

use hive_core::redact::redact;

#[derive(Clone, Default)]
pub struct RedactingStdout;

pub struct RedactingWriter(io::Stdout);

impl<'a> MakeWriter<'a> for RedactingStdout {
    type Writer = RedactingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter(io::stdout())
    }
}

impl Write for RedactingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.0.write_all(redact(&text).as_bytes())?;
        // Report the original length so tracing never re-sends a suffix.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
