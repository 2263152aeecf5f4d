use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// 下载进度条，刻度为千分比
pub struct DownloadBar {
    bar: ProgressBar,
}

impl DownloadBar {
    const SCALE: u64 = 1000;

    pub fn new(msg: &str) -> Self {
        let bar = ProgressBar::new(Self::SCALE);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {percent}% | {elapsed_precise}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(msg.to_string());
        bar.enable_steady_tick(Duration::from_millis(200));
        Self { bar }
    }

    pub fn set_fraction(&self, fraction: f64) {
        let pos = (fraction.clamp(0.0, 1.0) * Self::SCALE as f64).round() as u64;
        self.bar.set_position(pos);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// 分块上传进度，每个到达终态的分块推进一格
pub struct ChunkBar {
    bar: ProgressBar,
}

impl ChunkBar {
    pub fn new(total_chunks: u64) -> Result<Self> {
        let bar = ProgressBar::new(total_chunks);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green}  [{bar:40.cyan/blue}] {pos}/{len} 分块 | {msg} | ETD: {elapsed_precise}")?
                .progress_chars("#>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(200));
        Ok(Self { bar })
    }

    pub fn update(&self, done: u64, failed: u64) {
        self.bar.set_position(done + failed);
        if failed > 0 {
            self.bar.set_message(format!("失败 {failed}"));
        }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

pub struct Spinner {
    sp: ProgressBar,
}

impl Spinner {
    pub fn new(msg: &str) -> Self {
        let sp = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green}  {msg}") {
            sp.set_style(style);
        }
        sp.set_message(msg.to_string());
        sp.enable_steady_tick(Duration::from_millis(100));

        Self { sp }
    }

    pub fn finish(self, msg: &str) {
        if let Ok(style) = ProgressStyle::with_template("{msg}") {
            self.sp.set_style(style);
        }
        self.sp.finish_with_message(msg.to_string());
    }
}
