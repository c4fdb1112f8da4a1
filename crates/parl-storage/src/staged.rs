use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use parl_core::{EntityType, Record};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StagedError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}:{line}: malformed staged record: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}:{line}: staged record is not a JSON object", .path.display())]
    NotAnObject { path: PathBuf, line: usize },
}

/// Reads the newline-delimited staging files of one target site.
///
/// Files live at `<output_path>/<domain>/<staged file name>`; a missing file
/// reads as an empty sequence.
#[derive(Debug, Clone)]
pub struct StagedReader {
    root: PathBuf,
}

fn keep_all(_: &Record) -> bool {
    false
}

impl StagedReader {
    pub fn new(output_path: impl AsRef<Path>, domain: &str) -> Self {
        Self {
            root: output_path.as_ref().join(domain),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, entity: EntityType) -> PathBuf {
        self.root.join(entity.staged_file())
    }

    pub fn read(&self, entity: EntityType) -> Result<StagedRecords, StagedError> {
        self.read_excluding(entity, keep_all as fn(&Record) -> bool)
    }

    /// Streams records of `entity` in file order, skipping those for which
    /// `exclude` returns true. Each call reopens the file from the start.
    pub fn read_excluding<F>(
        &self,
        entity: EntityType,
        exclude: F,
    ) -> Result<StagedRecords<F>, StagedError>
    where
        F: FnMut(&Record) -> bool,
    {
        let path = self.path_for(entity);
        let lines = match File::open(&path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(StagedError::Io { path, source }),
        };
        Ok(StagedRecords {
            path,
            lines,
            line_no: 0,
            exclude,
        })
    }

    pub fn count(&self, entity: EntityType) -> Result<usize, StagedError> {
        let mut total = 0;
        for record in self.read(entity)? {
            record?;
            total += 1;
        }
        Ok(total)
    }
}

/// Lazy iterator over one staging file. Stops after the first error.
pub struct StagedRecords<F = fn(&Record) -> bool> {
    path: PathBuf,
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
    exclude: F,
}

impl<F> StagedRecords<F> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fail(&mut self, err: StagedError) -> Option<Result<Record, StagedError>> {
        self.lines = None;
        Some(Err(err))
    }
}

impl<F> Iterator for StagedRecords<F>
where
    F: FnMut(&Record) -> bool,
{
    type Item = Result<Record, StagedError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.as_mut()?.next()? {
                Ok(line) => line,
                Err(source) => {
                    let path = self.path.clone();
                    return self.fail(StagedError::Io { path, source });
                }
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<JsonValue>(trimmed) {
                Ok(JsonValue::Object(record)) => record,
                Ok(_) => {
                    let (path, line) = (self.path.clone(), self.line_no);
                    return self.fail(StagedError::NotAnObject { path, line });
                }
                Err(source) => {
                    let (path, line) = (self.path.clone(), self.line_no);
                    return self.fail(StagedError::Malformed { path, line, source });
                }
            };
            if (self.exclude)(&record) {
                continue;
            }
            return Some(Ok(record));
        }
    }
}
