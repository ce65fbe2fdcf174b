//! File releated handler.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Result};
use log::error;

use util::error_bail;

/// Trait for read file.
///
/// Only local file is supported now, other storage can be added by implementing the trait.
pub trait FileReader {
    type Reader: BufRead;

    /// Open a file by filename.
    fn get_reader(filename: &str) -> Result<Self::Reader>;
}

pub struct LocalFileReader;

impl FileReader for LocalFileReader {
    type Reader = BufReader<File>;

    fn get_reader(filename: &str) -> Result<Self::Reader> {
        match File::open(filename) {
            Ok(file) => Ok(BufReader::new(file)),
            Err(err) => {
                error_bail!("open file failed, filename: {}, error: {}", filename, err);
            }
        }
    }
}

/// Trait for write to file.
///
/// Content is written to a temporary file first, `commit` moves it to the final filename, so a
/// failed save never leaves a partial file under the final name.
pub trait FileWriter {
    type Writer: Write;

    /// Create a file by filename, parent dirs are created if missing.
    fn get_writer(filename: &str) -> Result<Self::Writer>;

    /// Move `tmp_filename` to `filename`.
    fn commit(tmp_filename: &str, filename: &str) -> Result<()>;
}

pub struct LocalFileWriter;

impl FileWriter for LocalFileWriter {
    type Writer = BufWriter<File>;

    fn get_writer(filename: &str) -> Result<Self::Writer> {
        if let Some(parent) = Path::new(filename).parent() {
            fs::create_dir_all(parent)?;
        }

        match File::create(filename) {
            Ok(file) => Ok(BufWriter::new(file)),
            Err(err) => {
                error_bail!("create file failed, filename: {}, error: {}", filename, err);
            }
        }
    }

    fn commit(tmp_filename: &str, filename: &str) -> Result<()> {
        match fs::rename(tmp_filename, filename) {
            Ok(_) => Ok(()),
            Err(err) => {
                error_bail!(
                    "rename file failed, from: {}, to: {}, error: {}",
                    tmp_filename,
                    filename,
                    err,
                );
            }
        }
    }
}
