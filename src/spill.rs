//! Local spill store for snapshots the sink would not take.
//!
//! Each snapshot becomes one JSON file under `<data_directory>/spill`, named
//! after its window start plus a random suffix so that repeated spills of
//! the same window never collide. Files are written to a temporary name and
//! renamed into place, so a reader never sees half a snapshot.

use crate::buckets::Snapshot;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Writes snapshots to a directory.
#[derive(Debug, Clone)]
pub struct Spill {
    root: PathBuf,
}

impl Spill {
    /// Use `<data_directory>/spill`, creating it if need be.
    pub fn new<P: AsRef<Path>>(data_directory: P) -> io::Result<Spill> {
        let root = data_directory.as_ref().join("spill");
        fs::create_dir_all(&root)?;
        Ok(Spill { root })
    }

    /// The spill directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist `snapshot`, returning the path written.
    pub fn write(&self, snapshot: &Snapshot) -> io::Result<PathBuf> {
        let stem = format!("window-{}-{}", snapshot.window.start, Uuid::new_v4());
        let tmp = self.root.join(format!(".{}.tmp", stem));
        let path = self.root.join(format!("{}.json", stem));

        let body = serde_json::to_vec(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        {
            let mut fp = fs::File::create(&tmp)?;
            fp.write_all(&body)?;
            fp.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        trace!("spilled window {} to {:?}", snapshot.window.start, path);
        Ok(path)
    }

    /// Spill files currently on disk, oldest window first.
    pub fn list(&self) -> io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buckets::{Buckets, HistogramBounds};
    use crate::internal::Registry;
    use crate::metric::{Kind, TagMap, TelemetryRecord};
    use std::time::Duration;
    use tempdir::TempDir;

    fn snapshot() -> Snapshot {
        let mut b = Buckets::new(
            Duration::from_secs(60),
            Duration::from_secs(0),
            HistogramBounds::default(),
            Registry::new(),
        );
        b.apply(TelemetryRecord::new(
            "req".into(),
            Kind::Counter,
            5.0,
            TagMap::default(),
            120_000,
        ));
        b.take_all().remove(0)
    }

    #[test]
    fn writes_json_named_by_window() {
        let dir = TempDir::new("telemetryhub-spill").unwrap();
        let spill = Spill::new(dir.path()).unwrap();
        assert_eq!(dir.path().join("spill"), spill.root());

        let snap = snapshot();
        let first = spill.write(&snap).unwrap();
        let second = spill.write(&snap).unwrap();
        assert_ne!(first, second);

        let name = first.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("window-120000-"));
        assert!(name.ends_with(".json"));

        let body = fs::read_to_string(&first).unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(120_000, json["window"]["start"]);
        assert_eq!(5.0, json["series"][0]["state"]["sum"]);

        assert_eq!(2, spill.list().unwrap().len());
    }

    #[test]
    fn unwritable_directory_is_an_error() {
        let dir = TempDir::new("telemetryhub-spill").unwrap();
        let blocker = dir.path().join("data");
        fs::write(&blocker, b"not a directory").unwrap();
        assert!(Spill::new(&blocker).is_err());
    }
}
