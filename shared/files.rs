//! File helpers shared by every store reader and writer.
//!
//! Stores are plain text and may be gzip-compressed; compression is chosen purely by
//! the `.gz` suffix of the path, both when reading and when writing.

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Returns true when the path names a gzip-compressed file.
pub fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Opens a file for reading, transparently decompressing `.gz` inputs.
pub fn open_reader(path: &Path) -> io::Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read + Send> = if is_gzip(path) {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(reader)
}

/// Creates (or truncates) a file for writing, compressing when the path ends in `.gz`.
///
/// Parent directories are created as needed. The returned writer must be dropped (or
/// flushed) before the file is complete.
pub fn create_writer(path: &Path) -> io::Result<Box<dyn Write + Send>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = BufWriter::new(File::create(path)?);
    let writer: Box<dyn Write + Send> = if is_gzip(path) {
        Box::new(GzEncoder::new(file, Compression::default()))
    } else {
        Box::new(file)
    };
    Ok(writer)
}

/// Location of the attribute sidecar that accompanies a grid store.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".attrs.toml");
    PathBuf::from(name)
}

/// Formats a float for a text store.
///
/// Finite values use the shortest round-trip representation; non-finite values are
/// written as `NaN`, `inf` and `-inf`, which `str::parse::<f64>` reads back.
pub fn format_float(buffer: &mut ryu::Buffer, value: f64) -> &str {
    if value.is_finite() {
        buffer.format_finite(value)
    } else if value.is_nan() {
        "NaN"
    } else if value > 0.0 {
        "inf"
    } else {
        "-inf"
    }
}

/// Parses a float cell from a text store. Empty cells are missing values.
pub fn parse_float(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Some(f64::NAN);
    }
    trimmed.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_values_round_trip_through_text() {
        let mut buffer = ryu::Buffer::new();
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1.25, -0.5] {
            let text = format_float(&mut buffer, value).to_string();
            let parsed = parse_float(&text).expect("float should parse");
            if value.is_nan() {
                assert!(parsed.is_nan());
            } else {
                assert_eq!(parsed, value);
            }
        }
    }

    #[test]
    fn empty_cell_is_missing() {
        assert!(parse_float("  ").expect("empty parses").is_nan());
        assert!(parse_float("abc").is_none());
    }

    #[test]
    fn gzip_round_trip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("store.tsv.gz");
        {
            let mut writer = create_writer(&path).expect("create writer");
            writer.write_all(b"a\tb\n1\t2\n").expect("write");
        }
        let mut text = String::new();
        open_reader(&path)
            .expect("open reader")
            .read_to_string(&mut text)
            .expect("read");
        assert_eq!(text, "a\tb\n1\t2\n");
    }

    #[test]
    fn sidecar_sits_next_to_store() {
        let path = Path::new("/data/climate.tsv.gz");
        assert_eq!(
            sidecar_path(path),
            PathBuf::from("/data/climate.tsv.gz.attrs.toml")
        );
    }
}
