use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};

/// Progress bar over `len` vectors labeled with `phase`.
pub(crate) fn progress_bar(len: usize, phase: &'static str) -> ProgressBar {
    ProgressBar::new(len as u64)
        .with_style(
            ProgressStyle::default_bar()
                .template("{msg:>8} {wide_bar} {pos:>9}/{len:>9} {per_sec:>14} ETA: {eta_precise}")
                .unwrap(),
        )
        .with_finish(ProgressFinish::AndLeave)
        .with_message(phase)
}
