//! Tab-separated grid stores.
//!
//! Layout: a header `northing  easting  <time_dim>  <variable...>` followed by one row
//! per (cell, time step). Rows may appear in any order; cells absent from the file are
//! `NaN`. Grids are read back north-up: northing descending, easting ascending,
//! whatever the row order or the orientation the store was written with. Variable
//! attributes are kept in a TOML sidecar next to the store.

use crate::grid::dataset::{GridDataset, GridError, Variable, VariableAttrs, coordinate_key};
use crate::shared::files::{create_writer, format_float, open_reader, parse_float, sidecar_path};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;

const NORTHING: &str = "northing";
const EASTING: &str = "easting";

#[derive(Debug, Default, Serialize, Deserialize)]
struct AttrsFile {
    #[serde(default)]
    variables: BTreeMap<String, VariableAttrs>,
}

/// Collects the distinct coordinates of one axis.
#[derive(Default)]
struct AxisBuilder {
    values: Vec<f64>,
    positions: HashMap<i64, usize>,
}

impl AxisBuilder {
    fn position(&mut self, value: f64) -> usize {
        let next = self.values.len();
        *self.positions.entry(coordinate_key(value)).or_insert_with(|| {
            self.values.push(value);
            next
        })
    }

    /// Sorted coordinates plus, for every first-appearance position, its sorted slot.
    fn finish(self, descending: bool) -> (Vec<f64>, Vec<usize>) {
        let mut order: Vec<usize> = (0..self.values.len()).collect();
        order.sort_by(|&a, &b| self.values[a].total_cmp(&self.values[b]));
        if descending {
            order.reverse();
        }
        let mut slots = vec![0; order.len()];
        for (slot, &position) in order.iter().enumerate() {
            slots[position] = slot;
        }
        let values = order.iter().map(|&position| self.values[position]).collect();
        (values, slots)
    }
}

struct Row {
    row: usize,
    col: usize,
    time: i64,
    values: Vec<f64>,
}

fn malformed(path: &Path, reason: impl Into<String>) -> GridError {
    GridError::Malformed {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn parse_time(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    trimmed.parse::<i64>().ok().or_else(|| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .map(|v| v as i64)
    })
}

/// Reads a grid store and its attribute sidecar.
pub fn read_grid(path: &Path) -> Result<GridDataset, GridError> {
    log::info!("Reading grid store {}", path.display());
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(open_reader(path)?);

    let headers = reader
        .headers()
        .map_err(|e| malformed(path, e.to_string()))?
        .clone();
    if headers.len() < 3 || &headers[0] != NORTHING || &headers[1] != EASTING {
        return Err(malformed(
            path,
            "header must start with 'northing', 'easting' and a time dimension",
        ));
    }
    let time_dim = headers[2].to_string();
    let names: Vec<String> = headers.iter().skip(3).map(str::to_string).collect();

    let mut northing = AxisBuilder::default();
    let mut easting = AxisBuilder::default();
    let mut times = BTreeSet::new();
    let mut rows = Vec::new();

    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| malformed(path, e.to_string()))?;
        let line_number = line + 2;
        if record.len() != headers.len() {
            return Err(malformed(
                path,
                format!("line {line_number} has {} fields, expected {}", record.len(), headers.len()),
            ));
        }
        let coordinate = |idx: usize| {
            parse_float(&record[idx])
                .filter(|v| v.is_finite())
                .ok_or_else(|| malformed(path, format!("line {line_number}: invalid coordinate '{}'", &record[idx])))
        };
        let n = coordinate(0)?;
        let e = coordinate(1)?;
        let time = parse_time(&record[2]).ok_or_else(|| {
            malformed(path, format!("line {line_number}: invalid time label '{}'", &record[2]))
        })?;
        let mut values = Vec::with_capacity(names.len());
        for (offset, name) in names.iter().enumerate() {
            let field = &record[offset + 3];
            let value = parse_float(field).ok_or_else(|| {
                malformed(path, format!("line {line_number}: invalid value '{field}' for '{name}'"))
            })?;
            values.push(value);
        }
        times.insert(time);
        rows.push(Row {
            row: northing.position(n),
            col: easting.position(e),
            time,
            values,
        });
    }

    let time: Vec<i64> = times.into_iter().collect();
    let (northing, row_slots) = northing.finish(true);
    let (easting, col_slots) = easting.finish(false);
    let shape = (northing.len(), easting.len(), time.len());
    let mut cubes: Vec<Array3<f64>> = names.iter().map(|_| Array3::from_elem(shape, f64::NAN)).collect();
    let mut seen = Array3::from_elem(shape, false);
    for row in rows {
        let t = time
            .binary_search(&row.time)
            .map_err(|_| malformed(path, "time label vanished while indexing"))?;
        let (r, c) = (row_slots[row.row], col_slots[row.col]);
        if seen[[r, c, t]] {
            return Err(malformed(
                path,
                format!(
                    "duplicate row for northing {}, easting {}, {} {}",
                    northing[r], easting[c], time_dim, row.time
                ),
            ));
        }
        seen[[r, c, t]] = true;
        for (cube, value) in cubes.iter_mut().zip(row.values) {
            cube[[r, c, t]] = value;
        }
    }

    let attrs = read_attrs(path)?;
    let mut dataset = GridDataset::new(northing, easting, time_dim, time)?;
    for (name, cube) in names.into_iter().zip(cubes) {
        let var_attrs = attrs.variables.get(&name).cloned().unwrap_or_default();
        dataset.insert(name, Variable::new(cube, var_attrs))?;
    }
    let (rows, cols, steps) = dataset.shape();
    log::info!(
        "Loaded {} variables on a {rows}x{cols} grid with {steps} {} steps",
        dataset.variables.len(),
        dataset.time_dim
    );
    Ok(dataset)
}

fn read_attrs(path: &Path) -> Result<AttrsFile, GridError> {
    let sidecar = sidecar_path(path);
    if !sidecar.exists() {
        return Ok(AttrsFile::default());
    }
    let text = fs::read_to_string(&sidecar)?;
    Ok(toml::from_str(&text)?)
}

/// Writes a dataset as a grid store, replacing any existing store and sidecar.
pub fn write_grid(path: &Path, dataset: &GridDataset) -> Result<(), GridError> {
    log::info!("Writing grid store {}", path.display());
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(create_writer(path)?);

    let names: Vec<&String> = dataset.variables.keys().collect();
    let mut header = vec![NORTHING.to_string(), EASTING.to_string(), dataset.time_dim.clone()];
    header.extend(names.iter().map(|n| n.to_string()));
    writer
        .write_record(&header)
        .map_err(|e| malformed(path, e.to_string()))?;

    let views: Vec<_> = dataset.variables.values().map(|v| v.data.view()).collect();
    let mut buffer = ryu::Buffer::new();
    let mut record = csv::StringRecord::with_capacity(64, header.len());
    for (r, &n) in dataset.northing.iter().enumerate() {
        for (c, &e) in dataset.easting.iter().enumerate() {
            for (t, &label) in dataset.time.iter().enumerate() {
                record.clear();
                record.push_field(format_float(&mut buffer, n));
                record.push_field(format_float(&mut buffer, e));
                record.push_field(&label.to_string());
                for view in &views {
                    record.push_field(format_float(&mut buffer, view[[r, c, t]]));
                }
                writer
                    .write_record(&record)
                    .map_err(|e| malformed(path, e.to_string()))?;
            }
        }
    }
    writer.flush()?;
    drop(writer);

    write_attrs(path, dataset)
}

fn write_attrs(path: &Path, dataset: &GridDataset) -> Result<(), GridError> {
    let sidecar = sidecar_path(path);
    let attrs = AttrsFile {
        variables: dataset
            .variables
            .iter()
            .filter(|(_, v)| v.attrs != VariableAttrs::default())
            .map(|(name, v)| (name.clone(), v.attrs.clone()))
            .collect(),
    };
    if attrs.variables.is_empty() {
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }
        return Ok(());
    }
    let mut file = create_writer(&sidecar)?;
    file.write_all(toml::to_string_pretty(&attrs)?.as_bytes())?;
    file.flush()?;
    Ok(())
}
