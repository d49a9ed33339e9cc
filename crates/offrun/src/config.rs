//! Bridge options.

/// Settings shared by the caller and executor halves of a bridge.
#[derive(Clone, Debug)]
pub struct Options {
    /// Name used in log events to tell bridges apart.
    pub name: String,
    /// Move buffers, ports and bitmaps by transfer instead of copying them.
    pub use_transfer_detection: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: "offrun".into(),
            use_transfer_detection: true,
        }
    }
}

impl Options {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_transfer_detection(mut self, enabled: bool) -> Self {
        self.use_transfer_detection = enabled;
        self
    }
}
