use crate::buckets::Snapshot;
use crate::sink::{ExportError, Sink};

/// Null sink
///
/// This sink is intended for testing and demonstration. Every snapshot it
/// receives is discarded and counted.
pub struct Null {
    name: String,
    exported: usize,
}

impl Null {
    /// Create a new Null sink
    pub fn new(config: &NullConfig) -> Null {
        Null {
            name: config.config_path.clone(),
            exported: 0,
        }
    }

    /// Snapshots discarded so far.
    pub fn exported(&self) -> usize {
        self.exported
    }
}

/// Configuration for the `Null` sink
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NullConfig {
    /// The sink's name, as it appears in logs.
    pub config_path: String,
}

impl NullConfig {
    /// Create a new `NullConfig`
    pub fn new(config_path: String) -> NullConfig {
        NullConfig { config_path }
    }
}

impl Sink for Null {
    fn export(&mut self, _: &Snapshot) -> Result<(), ExportError> {
        // discard snapshot
        self.exported += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buckets::{Snapshot, Window};

    #[test]
    fn counts_what_it_discards() {
        let mut null = Null::new(&NullConfig::new("sinks.null".into()));
        assert_eq!("sinks.null", null.name());
        let snapshot = Snapshot {
            window: Window::containing(0, 60_000),
            series: Vec::new(),
        };
        for _ in 0..3 {
            null.export(&snapshot).unwrap();
        }
        assert_eq!(3, null.exported());
    }
}
