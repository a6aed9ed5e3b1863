use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A duplicate group as it appears in the export. `keeper` is `null` for a group that was
/// left unresolved.
#[derive(Debug, Serialize)]
pub struct ReportRow<'a> {
    pub group: usize,
    pub keeper: Option<&'a Path>,
    pub members: &'a [PathBuf],
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    generated_at: String,
    groups: Vec<ReportRow<'a>>,
}

/// Writes the groups as one pretty-printed JSON document, numbered from 1.
pub fn write_groups<'a, W: Write>(
    writer: W,
    rows: impl IntoIterator<Item = ReportRow<'a>>,
) -> Result<(), ReportError> {
    let document = ReportDocument {
        generated_at: chrono::Utc::now().to_rfc3339(),
        groups: rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| ReportRow { group: i + 1, ..row })
            .collect(),
    };

    let mut writer = writer;
    serde_json::to_writer_pretty(&mut writer, &document)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

pub fn export_groups<'a>(
    path: &Path,
    rows: impl IntoIterator<Item = ReportRow<'a>>,
) -> Result<(), ReportError> {
    let file = File::create(path)?;
    write_groups(BufWriter::new(file), rows)?;
    log::info!("Wrote duplicate report to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn test_groups_are_numbered_with_keeper() {
        let first = vec![PathBuf::from("/v/a.mp4"), PathBuf::from("/v/b.mp4")];
        let second = vec![PathBuf::from("/v/c.mp4"), PathBuf::from("/v/d.mp4")];
        let mut out = Vec::new();

        write_groups(
            &mut out,
            [
                ReportRow {
                    group: 0,
                    keeper: Some(Path::new("/v/b.mp4")),
                    members: &first,
                },
                ReportRow {
                    group: 0,
                    keeper: None,
                    members: &second,
                },
            ],
        )
        .unwrap();

        let doc: Value = serde_json::from_slice(&out).unwrap();
        let groups = doc["groups"].as_array().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0]["group"], 1);
        assert_eq!(groups[0]["keeper"], "/v/b.mp4");
        assert_eq!(groups[0]["members"][0], "/v/a.mp4");
        assert_eq!(groups[1]["group"], 2);
        assert!(groups[1]["keeper"].is_null());
        assert!(doc["generated_at"].is_string());
    }

    #[test]
    fn test_export_to_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("duplicates.json");

        export_groups(&path, std::iter::empty()).unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["groups"].as_array().unwrap().len(), 0);
    }
}
