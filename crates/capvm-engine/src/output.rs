//! Where script output goes

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// In-memory output shared between the engine and whoever reads it.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<String>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&self, s: &str) {
        self.0.borrow_mut().push_str(s);
    }

    pub fn contents(&self) -> String {
        self.0.borrow().clone()
    }

    /// Returns and clears the buffered text.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

/// Destination for `print` and exception reports.
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    #[default]
    Stdout,
    Buffer(SharedBuffer),
    Discard,
}

impl OutputSink {
    pub fn write_str(&self, s: &str) {
        match self {
            OutputSink::Stdout => {
                let mut out = std::io::stdout().lock();
                if let Err(err) = out.write_all(s.as_bytes()).and_then(|_| out.flush()) {
                    log::warn!("script output lost: {}", err);
                }
            }
            OutputSink::Buffer(buffer) => buffer.push_str(s),
            OutputSink::Discard => {}
        }
    }
}
