//! Console progress bars for model loading and callback-less decode.

use indicatif::{ProgressBar, ProgressStyle};

pub struct Progress {
    bar: ProgressBar,
    size: usize,
}

impl Progress {
    pub fn new(size: usize, msg: &str) -> Progress {
        let bar = ProgressBar::new(size as u64);
        let sty = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:60.cyan/blue} {pos:>4}/{len:4} {msg}",
        )
        .unwrap()
        .progress_chars("##-");
        bar.set_style(sty);
        bar.set_message(msg.to_string());
        Self { bar, size }
    }

    pub fn update(&self, pos: usize, msg: &str) {
        let cur = self.bar.position();
        if pos as u64 > cur {
            self.bar.inc(pos as u64 - cur);
        }
        if !msg.is_empty() {
            self.bar.set_message(msg.to_string());
        }
    }

    pub fn finish(&self) {
        let pos = self.bar.position();
        self.bar.inc(self.size as u64 - pos);
        self.bar.finish_and_clear();
    }
}
