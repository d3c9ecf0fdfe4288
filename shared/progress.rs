use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;

/// Stages that report progress while a command runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Spans,
    FoldEvaluation,
    MergeResults,
    ApplyYears,
}

impl Stage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Spans => "Computing span indices",
            Self::FoldEvaluation => "Evaluating folds",
            Self::MergeResults => "Merging results",
            Self::ApplyYears => "Applying model",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting completed units of work.
pub trait TaskProgress {
    fn on_stage_start(&mut self, stage: Stage, total_units: usize) {
        let _ = (stage, total_units);
    }
    fn on_unit_complete(&mut self, stage: Stage) {
        let _ = stage;
    }
    fn on_stage_finish(&mut self, stage: Stage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl TaskProgress for NoopProgress {}

/// Terminal progress bars, one per stage.
#[derive(Default)]
pub struct ConsoleProgress {
    bar: Option<ProgressBar>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskProgress for ConsoleProgress {
    fn on_stage_start(&mut self, stage: Stage, total_units: usize) {
        let bar = ProgressBar::new(total_units as u64);
        let style = ProgressStyle::with_template(&format!(
            "> {stage} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{elapsed}})"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        self.bar = Some(bar);
    }

    fn on_unit_complete(&mut self, stage: Stage) {
        let _ = stage;
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn on_stage_finish(&mut self, stage: Stage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        log::info!("{stage}: done");
    }
}
