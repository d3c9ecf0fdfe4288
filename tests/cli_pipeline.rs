use std::fs;
use std::path::Path;
use std::process::Command;

use dieback::grid::dataset::{GridDataset, Variable, VariableAttrs};
use dieback::grid::io::{read_grid, write_grid};
use ndarray::Array3;
use tempfile::tempdir;

fn run(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_dieback"))
        .current_dir(dir)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("run dieback cli")
}

fn assert_success(output: &std::process::Output, step: &str) {
    assert!(
        output.status.success(),
        "{step} failed with {:?}\nstdout:\n{}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn write_inputs(dir: &Path) {
    let northing: Vec<f64> = (0..4).map(|r| 500.0 - 10.0 * r as f64).collect();
    let easting: Vec<f64> = (0..4).map(|c| 20.0 + 10.0 * c as f64).collect();

    let pr1 = Array3::from_shape_fn((4, 4, 4), |(r, c, t)| (r * 4 + c) as f64 * 3.0 + 50.0 * t as f64);
    let mut climate =
        GridDataset::new(northing.clone(), easting.clone(), "year", vec![2009, 2010, 2011, 2012]).expect("axes");
    climate
        .insert("PR1", Variable::new(pr1.clone(), VariableAttrs::with_units("mm")))
        .expect("insert PR1");
    write_grid(&dir.join("climate.tsv"), &climate).expect("write climate");

    let tpa = Array3::from_shape_fn((4, 4, 3), |(r, c, t)| {
        if (r + c) % 4 == 0 { 0.0 } else { 0.1 * pr1[[r, c, t + 1]] }
    });
    let mut mortality = GridDataset::new(northing, easting, "year", vec![2010, 2011, 2012]).expect("axes");
    mortality
        .insert("tpa", Variable::new(tpa, VariableAttrs::with_units("trees per acre")))
        .expect("insert tpa");
    write_grid(&dir.join("mortality.tsv"), &mortality).expect("write mortality");

    fs::write(dir.join("folds.toml"), "grid_size = 2\n").expect("folds config");
    fs::write(
        dir.join("samples.toml"),
        "years = [2010, 2013]\ntarget = \"tpa\"\n\n[features.PR]\nback = 2\nlags = 1\n",
    )
    .expect("samples config");
    fs::write(dir.join("forest.toml"), "n_estimators = 5\nmax_depth = 3\nseed = 3\n").expect("forest config");
    fs::write(
        dir.join("apply.toml"),
        "prediction_variable = \"tpa_pred\"\n\n[year_range]\nstart = 2011\nend = 2013\n\n[prediction_variable_info]\nunits = \"trees per acre\"\n",
    )
    .expect("apply config");
}

#[test]
fn full_pipeline_produces_every_artifact() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    write_inputs(dir);

    assert_success(&run(dir, &["folds", "mortality.tsv", "folds.toml", "mortality_folds.tsv"]), "folds");
    assert_success(
        &run(dir, &["samples", "mortality_folds.tsv", "climate.tsv", "samples.toml", "samples.tsv"]),
        "samples",
    );
    assert_success(&run(dir, &["filter", "samples.tsv", "positive.tsv"]), "filter");
    assert_success(
        &run(
            dir,
            &["evaluate", "positive.tsv", "result.json.gz", "--forest", "forest.toml", "--workers", "2"],
        ),
        "evaluate",
    );
    assert_success(&run(dir, &["performance", "result.json.gz", "performance.tsv"]), "performance");
    assert_success(
        &run(dir, &["train", "positive.tsv", "model.toml", "--year", "2011", "--forest", "forest.toml"]),
        "train",
    );
    assert_success(
        &run(dir, &["apply", "climate.tsv", "model.toml", "apply.toml", "predictions.tsv", "--workers", "2"]),
        "apply",
    );
    assert_success(
        &run(dir, &["reformat", "result.json.gz", "mortality_folds.tsv", "reformatted.tsv"]),
        "reformat",
    );

    let samples = fs::read_to_string(dir.join("samples.tsv")).expect("samples");
    let positive = fs::read_to_string(dir.join("positive.tsv")).expect("positive");
    assert!(positive.lines().count() < samples.lines().count());

    let performance = fs::read_to_string(dir.join("performance.tsv")).expect("performance");
    assert_eq!(performance.lines().next(), Some("train_year\teval_year\tr2\trmse"));
    assert_eq!(performance.lines().count(), 1 + 3 * 3);

    let model = fs::read_to_string(dir.join("model.toml")).expect("model");
    assert!(model.contains("training_year = 2011"));

    let predictions = read_grid(&dir.join("predictions.tsv")).expect("predictions");
    assert_eq!(predictions.time, vec![2011, 2012]);
    let predicted = predictions.variable("tpa_pred").expect("tpa_pred");
    assert_eq!(predicted.attrs.units.as_deref(), Some("trees per acre"));
    assert!(predicted.data.iter().all(|v| v.is_finite()));

    let reformatted = read_grid(&dir.join("reformatted.tsv")).expect("reformatted");
    let tpa = reformatted.values("tpa").expect("tpa");
    // zero-mortality cells were filtered out before evaluation
    assert!(tpa[[0, 0, 0]].is_nan());
    assert!(tpa[[0, 1, 0]].is_finite());
}

#[test]
fn invalid_configuration_exits_with_error() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    write_inputs(dir);
    fs::write(dir.join("bad_folds.toml"), "grid_size = 0\n").expect("bad config");

    let output = run(dir, &["folds", "mortality.tsv", "bad_folds.toml", "out.tsv"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error: Invalid configuration"), "{stderr}");
    assert!(!dir.join("out.tsv").exists());

    let output = run(dir, &["folds", "mortality.tsv", "missing.toml", "out.tsv"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn climate_preparation_commands() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();

    let months: Vec<i64> = (2000..2002).flat_map(|y| (1..=12).map(move |m| y * 100 + m)).collect();
    let mut monthly = GridDataset::new(vec![1.0, 2.0], vec![1.0], "month", months.clone()).expect("axes");
    monthly
        .insert("ppt", Variable::new(Array3::from_elem((2, 1, months.len()), 10.0), VariableAttrs::with_units("mm")))
        .expect("insert ppt");
    write_grid(&dir.join("monthly.tsv"), &monthly).expect("write monthly");
    fs::write(dir.join("aggregate.toml"), "shift_months = 3\n\n[variables]\nppt = \"sum\"\n").expect("config");
    assert_success(&run(dir, &["aggregate", "monthly.tsv", "aggregate.toml", "yearly.tsv"]), "aggregate");
    let yearly = read_grid(&dir.join("yearly.tsv")).expect("yearly");
    assert_eq!(yearly.time, vec![2000, 2001, 2002]);
    assert_eq!(yearly.values("ppt").expect("ppt")[[0, 0, 1]], 120.0);
    assert_eq!(yearly.values("ppt").expect("ppt")[[1, 0, 2]], 30.0);

    let years: Vec<i64> = (1981..=2010).collect();
    let ppt = Array3::from_shape_fn((2, 2, years.len()), |(r, c, t)| {
        200.0 + 37.0 * ((t * 7 + r * 3 + c) % 11) as f64
    });
    let mut annual = GridDataset::new(vec![1.0, 2.0], vec![1.0, 2.0], "year", years).expect("axes");
    annual
        .insert("ppt", Variable::new(ppt, VariableAttrs::with_units("mm")))
        .expect("insert ppt");
    write_grid(&dir.join("reference.tsv"), &annual.select_time(1981, 2000).expect("reference"))
        .expect("write reference");
    write_grid(&dir.join("focal.tsv"), &annual.select_time(2001, 2010).expect("focal")).expect("write focal");
    fs::write(
        dir.join("indices.toml"),
        r#"reference_period = [1981, 2000]
focal_period = [2001, 2010]
spans = [1, 2]

[[indices]]
name = "PR"
name_format = "PR{span}"
long_name_format = "{span}-year precipitation"

[[indices]]
name = "SPI"
name_format = "SPI{span}"
long_name_format = "{span}-year SPI"
"#,
    )
    .expect("indices config");
    assert_success(
        &run(
            dir,
            &["indices", "focal.tsv", "indices.toml", "indices.tsv", "--reference", "reference.tsv", "--workers", "2"],
        ),
        "indices",
    );
    let indices = read_grid(&dir.join("indices.tsv")).expect("indices");
    assert_eq!(indices.time, (2001..=2010).collect::<Vec<_>>());
    for name in ["ppt", "PR1", "PR2", "SPI1", "SPI2"] {
        assert!(indices.variables.contains_key(name), "missing {name}");
    }
    assert_eq!(
        indices.variable("SPI2").expect("SPI2").attrs.long_name.as_deref(),
        Some("2-year SPI")
    );
}

#[test]
fn projection_summaries() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();

    for (member, offset) in [("b_model.tsv", 10.0), ("a_model.tsv", 0.0), ("c_model.tsv", 5.0)] {
        let mut ds = GridDataset::new(vec![2.0, 1.0], vec![1.0], "year", vec![2030, 2031]).expect("axes");
        let tpa = Array3::from_shape_fn((2, 1, 2), |(r, _, t)| offset + (r * 2 + t) as f64);
        ds.insert("tpa", Variable::new(tpa, VariableAttrs::default()))
            .expect("insert tpa");
        write_grid(&dir.join(member), &ds).expect("write member");
    }
    fs::write(
        dir.join("stats.toml"),
        r#"[[statistics]]
name = "tpa_mean"
variable = "tpa"
statistic = "mean"

[[statistics]]
name = "tpa_median"
variable = "tpa"
statistic = "median"

[statistics.attrs]
units = "trees per acre"
"#,
    )
    .expect("statistics config");

    assert_success(
        &run(dir, &["ensemble", "stats.toml", "ensemble.tsv", "b_model.tsv", "a_model.tsv", "c_model.tsv"]),
        "ensemble",
    );
    let ensemble = read_grid(&dir.join("ensemble.tsv")).expect("ensemble");
    assert_eq!(ensemble.time, vec![2030, 2031]);
    assert_eq!(ensemble.values("tpa_mean").expect("mean")[[1, 0, 1]], 3.0 + 5.0);
    let median = ensemble.variable("tpa_median").expect("median");
    assert_eq!(median.data[[0, 0, 0]], 5.0);
    assert_eq!(median.attrs.units.as_deref(), Some("trees per acre"));

    assert_success(&run(dir, &["accumulate", "a_model.tsv", "stats.toml", "summary.tsv"]), "accumulate");
    let summary = read_grid(&dir.join("summary.tsv")).expect("summary");
    assert_eq!(summary.time, vec![2031]);
    assert_eq!(summary.values("tpa_mean").expect("mean")[[1, 0, 0]], 2.5);
}
