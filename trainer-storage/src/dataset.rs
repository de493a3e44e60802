//! Line-oriented dataset helpers shared by the framework launchers.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Result, StorageError};
use crate::storage::{StorageDriver, StorageLocation};

/// Every n-th row goes to the evaluation split.
pub const EVAL_EVERY: usize = 10;

/// Read `field` from every non-blank JSONL row of `path`.
///
/// String values are returned as-is, other JSON values in their compact
/// form. A row without `field` is an error.
pub fn read_text_lines(path: &Path, field: &str) -> Result<Vec<String>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut lines = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: Value = serde_json::from_str(line)?;
        let value = row.get(field).ok_or_else(|| {
            StorageError::dataset(format!(
                "Dataset row {} missing '{field}' field",
                index + 1
            ))
        })?;
        lines.push(match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        });
    }
    Ok(lines)
}

/// Split rows into `(train, eval)`: row indices divisible by
/// [`EVAL_EVERY`] go to eval. At most `max_samples` rows are consumed;
/// `Some(0)` means no limit.
pub fn split_corpus<I>(lines: I, max_samples: Option<usize>) -> Result<(Vec<String>, Vec<String>)>
where
    I: IntoIterator<Item = String>,
{
    let limit = max_samples.filter(|&n| n > 0).unwrap_or(usize::MAX);
    let mut train = Vec::new();
    let mut eval = Vec::new();
    for (index, line) in lines.into_iter().take(limit).enumerate() {
        if index % EVAL_EVERY == 0 {
            eval.push(line);
        } else {
            train.push(line);
        }
    }
    if train.is_empty() || eval.is_empty() {
        return Err(StorageError::dataset(
            "Dataset too small. Need at least 10 rows for train/eval split.",
        ));
    }
    Ok((train, eval))
}

/// Resolve a dataset URI to a local file. Local paths are returned
/// directly; `s3://` objects are downloaded into `scratch_dir`.
pub async fn fetch_dataset(dataset_uri: &str, scratch_dir: &Path) -> Result<PathBuf> {
    match StorageLocation::parse(dataset_uri)? {
        StorageLocation::Local(path) => Ok(path),
        StorageLocation::S3 { bucket, prefix } => {
            if prefix.is_empty() {
                return Err(StorageError::InvalidUri {
                    uri: dataset_uri.to_string(),
                    reason: "dataset URI must name an object".into(),
                });
            }
            let driver = StorageDriver::from_uri(&format!("s3://{bucket}"))?;
            let file_name = prefix.rsplit('/').next().unwrap_or(&prefix);
            let target = scratch_dir.join(file_name);
            driver.download_file(&prefix, &target).await?;
            tracing::info!(uri = %dataset_uri, path = %target.display(), "Dataset downloaded");
            Ok(target)
        }
    }
}
