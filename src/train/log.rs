//! Append-only per-epoch statistics log

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub fn log_path(output_dir: &Path) -> PathBuf {
    output_dir.join("log.txt")
}

/// One JSON object per line: `train_<metric>` for every metric plus `epoch`
pub fn append_epoch_stats(path: &Path, epoch: usize, stats: &BTreeMap<String, f64>) -> Result<()> {
    let mut record = Map::new();
    for (name, value) in stats {
        record.insert(format!("train_{name}"), Value::from(*value));
    }
    record.insert("epoch".to_string(), Value::from(epoch));

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", Value::Object(record))?;
    Ok(())
}

/// `(epoch, train_loss)` pairs recorded so far; empty if the log does not exist
pub fn read_loss_history(path: &Path) -> Result<Vec<(usize, f64)>> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut history = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = serde_json::from_str(&line)
            .map_err(|e| Error::Serialization(format!("{} line {}: {e}", path.display(), n + 1)))?;
        let epoch = record.get("epoch").and_then(Value::as_u64);
        let loss = record.get("train_loss").and_then(Value::as_f64);
        if let (Some(epoch), Some(loss)) = (epoch, loss) {
            history.push((epoch as usize, loss));
        }
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_records_are_prefixed_and_appended() {
        let dir = TempDir::new().unwrap();
        let path = log_path(dir.path());
        let mut stats = BTreeMap::new();
        stats.insert("loss".to_string(), 2.5);
        stats.insert("lr".to_string(), 0.001);
        append_epoch_stats(&path, 0, &stats).unwrap();
        stats.insert("loss".to_string(), 2.0);
        append_epoch_stats(&path, 1, &stats).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["train_loss"], 2.5);
        assert_eq!(first["train_lr"], 0.001);
        assert_eq!(first["epoch"], 0);

        assert_eq!(read_loss_history(&path).unwrap(), vec![(0, 2.5), (1, 2.0)]);
    }

    #[test]
    fn test_missing_log_has_no_history() {
        let dir = TempDir::new().unwrap();
        assert!(read_loss_history(&log_path(dir.path())).unwrap().is_empty());
    }
}
