// Progress bar management using indicatif.
// We keep all bars under one MultiProgress so they render on separate lines.
// The library default is "disabled"; the binary enables bars unless --debug
// is set, since debug logging and bars fight over stderr.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fs;
use std::sync::Arc;

#[derive(Clone)]
pub struct ProgressManager {
    multi: Option<Arc<MultiProgress>>,
}

impl ProgressManager {
    // Create a new manager. If enabled=false, no bars are created.
    pub fn new(enabled: bool) -> Self {
        let multi = if enabled {
            Some(Arc::new(MultiProgress::new()))
        } else {
            None
        };
        Self { multi }
    }

    // Create a bar for file-byte progress with a label. Returns None when
    // disabled or when the file size cannot be determined (archive members).
    pub fn new_file_bar(&self, path: &str, label: &str) -> Option<ProgressBar> {
        let mp = self.multi.as_ref()?;
        let size = fs::metadata(path).ok()?.len();
        let bar = mp.add(ProgressBar::new(size));
        bar.set_style(progress_style());
        bar.set_prefix(label.to_string());
        Some(bar)
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:20} {bytes:>10}/{total_bytes:<10} [{bar:67}] {percent:>3}%",
    )
    .unwrap()
    .progress_chars("█ ")
}
