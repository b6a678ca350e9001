//! Progress accounting and terminal rendering.
//!
//! Every unit of work the manager schedules (a track download, an overall
//! decrypt pass, a merge, the final mux) is a [`Task`]. Tasks carry a
//! value/total pair counted in segments plus byte counters, and download
//! tasks own a [`SpeedContainer`] fed by the segment fetch loop.
//!
//! Rendering goes through a single [`indicatif::MultiProgress`]: one bar per
//! task, refreshed by a cooperative ~150 ms ticker. Log output must go
//! through [`ProgressManager::println`] (or the tracing writer returned by
//! [`ProgressManager::log_writer`]) so that lines are printed above the
//! progress region and never interleave within a frame.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::util::{format_size, format_speed};

const RENDER_INTERVAL: Duration = Duration::from_millis(150);
const SPEED_WINDOW: Duration = Duration::from_secs(1);
const SPEED_RING_SIZE: usize = 10;

/// What a task is doing, for display grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Download,
    Decrypt,
    Merge,
    Mux,
}

/// Rolling byte-rate estimator: every time at least one second has elapsed
/// the byte delta of that window is pushed into a fixed-size ring, and the
/// instantaneous speed is the mean of the ring.
#[derive(Debug, Default)]
pub struct SpeedContainer {
    inner: Mutex<SpeedInner>,
}

#[derive(Debug)]
struct SpeedInner {
    window_bytes: u64,
    total_bytes: u64,
    ring: Vec<u64>,
    now_speed: u64,
    last_reset: Option<Instant>,
    started: Option<Instant>,
}

impl Default for SpeedInner {
    fn default() -> Self {
        SpeedInner {
            window_bytes: 0,
            total_bytes: 0,
            ring: Vec::with_capacity(SPEED_RING_SIZE),
            now_speed: 0,
            last_reset: None,
            started: None,
        }
    }
}

impl SpeedContainer {
    /// Record downloaded bytes (network bytes only, never decrypted output).
    pub fn add(&self, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.started.get_or_insert(now);
        inner.last_reset.get_or_insert(now);
        inner.window_bytes += bytes;
        inner.total_bytes += bytes;
    }

    /// Called by the renderer; folds the current window into the ring when a
    /// second has elapsed.
    pub fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let Some(last) = inner.last_reset else { return };
        if now.duration_since(last) < SPEED_WINDOW {
            return;
        }
        if inner.ring.len() >= SPEED_RING_SIZE {
            inner.ring.remove(0);
        }
        let window = inner.window_bytes;
        inner.ring.push(window);
        inner.window_bytes = 0;
        inner.last_reset = Some(now);
        inner.now_speed = if inner.ring.is_empty() {
            0
        } else {
            inner.ring.iter().sum::<u64>() / inner.ring.len() as u64
        };
    }

    /// Mean of the rolling window, bytes per second.
    pub fn now_speed(&self) -> u64 {
        self.inner.lock().unwrap().now_speed
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().unwrap().total_bytes
    }

    /// Average over the task's whole lifetime.
    pub fn average_speed(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        match inner.started {
            Some(start) => {
                let secs = start.elapsed().as_secs_f64();
                if secs > 0.0 {
                    (inner.total_bytes as f64 / secs) as u64
                } else {
                    0
                }
            }
            None => 0,
        }
    }
}

#[derive(Debug, Default)]
struct TaskState {
    value: u64,
    total: Option<u64>,
    current_bytes: u64,
    total_bytes: Option<u64>,
    started: bool,
    finished: bool,
    error: Option<String>,
}

/// One progress element.
pub struct Task {
    pub kind: TaskKind,
    pub description: String,
    state: Mutex<TaskState>,
    pub speed: Arc<SpeedContainer>,
    bar: ProgressBar,
}

impl Task {
    pub fn start(&self) {
        self.state.lock().unwrap().started = true;
    }

    /// Fix the segment total (and optionally the byte total) once known.
    pub fn set_total(&self, total: u64, total_bytes: Option<u64>) {
        let mut st = self.state.lock().unwrap();
        st.total = Some(total);
        if total_bytes.is_some() {
            st.total_bytes = total_bytes;
        }
        self.bar.set_length(total);
    }

    pub fn increment(&self, n: u64) {
        let mut st = self.state.lock().unwrap();
        st.started = true;
        st.value += n;
        if let Some(total) = st.total {
            if st.value >= total {
                st.finished = true;
            }
        }
    }

    /// Set the absolute segment position and, when given, the byte count.
    pub fn update(&self, value: u64, current_bytes: Option<u64>) {
        let mut st = self.state.lock().unwrap();
        st.started = true;
        st.value = value;
        if let Some(b) = current_bytes {
            st.current_bytes = b;
        }
        if let Some(total) = st.total {
            if st.value >= total {
                st.finished = true;
            }
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.state.lock().unwrap().current_bytes += bytes;
        self.speed.add(bytes);
    }

    pub fn set_error(&self, message: &str) {
        let mut st = self.state.lock().unwrap();
        st.error = Some(message.to_string());
        st.finished = true;
        self.bar.abandon_with_message(format!("✗ {message}"));
    }

    pub fn value(&self) -> u64 {
        self.state.lock().unwrap().value
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    pub fn is_errored(&self) -> bool {
        self.state.lock().unwrap().error.is_some()
    }

    fn render(&self) {
        self.speed.tick();
        let st = self.state.lock().unwrap();
        if st.error.is_some() {
            return;
        }
        self.bar.set_position(st.value);
        let mut msg = format_size(st.current_bytes.max(self.speed.total_bytes()));
        if let Some(tb) = st.total_bytes {
            msg = format!("{msg}/{}", format_size(tb));
        }
        if self.kind == TaskKind::Download || self.kind == TaskKind::Decrypt {
            msg.push_str(&format!(" {}", format_speed(self.speed.now_speed())));
        }
        self.bar.set_message(msg);
        if st.finished && !self.bar.is_finished() {
            self.bar.finish();
        }
    }
}

/// The task registry and single terminal authority.
pub struct ProgressManager {
    multi: MultiProgress,
    tasks: Mutex<Vec<Arc<Task>>>,
    running: Arc<AtomicBool>,
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressManager {
    pub fn new() -> ProgressManager {
        ProgressManager {
            multi: MultiProgress::new(),
            tasks: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A manager that draws nothing; used by tests and `--no-progress` runs.
    pub fn hidden() -> ProgressManager {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        ProgressManager {
            multi,
            tasks: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add_task(&self, kind: TaskKind, description: &str) -> Arc<Task> {
        let bar = self.multi.add(ProgressBar::new(1));
        let prefix = match kind {
            TaskKind::Download => "DL ",
            TaskKind::Decrypt => "DEC",
            TaskKind::Merge => "MRG",
            TaskKind::Mux => "MUX",
        };
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix:.bold} {wide_bar:.cyan/blue} {pos:>5}/{len:<5} {msg}",
            )
            .unwrap(),
        );
        bar.set_prefix(format!("{prefix} {description}"));
        let task = Arc::new(Task {
            kind,
            description: description.to_string(),
            state: Mutex::new(TaskState::default()),
            speed: Arc::new(SpeedContainer::default()),
            bar,
        });
        self.tasks.lock().unwrap().push(task.clone());
        task
    }

    /// Spawn the cooperative renderer. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RENDER_INTERVAL);
            while manager.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                manager.render_all();
            }
        });
    }

    fn render_all(&self) {
        for task in self.tasks.lock().unwrap().iter() {
            task.render();
        }
    }

    /// One final draw, a short grace period for in-flight updates, then the
    /// terminal is yielded back.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.render_all();
        tokio::time::sleep(RENDER_INTERVAL).await;
        self.render_all();
    }

    /// Print a line above the progress region (clears, prints, redraws).
    pub fn println(&self, line: &str) {
        let _ = self.multi.println(line);
    }

    /// A `MakeWriter` for `tracing_subscriber` that routes log lines through
    /// the progress region.
    pub fn log_writer(self: &Arc<Self>) -> LogWriterFactory {
        LogWriterFactory { manager: self.clone() }
    }
}

#[derive(Clone)]
pub struct LogWriterFactory {
    manager: Arc<ProgressManager>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter { manager: self.manager.clone(), buf: Vec::new() }
    }
}

pub struct LogWriter {
    manager: Arc<ProgressManager>,
    buf: Vec<u8>,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines() {
            self.manager.println(line);
        }
        self.buf.clear();
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_counts_and_finish() {
        let manager = ProgressManager::hidden();
        let task = manager.add_task(TaskKind::Download, "video");
        task.set_total(3, Some(3000));
        task.increment(1);
        task.increment(1);
        assert!(!task.is_finished());
        task.increment(1);
        assert!(task.is_finished());
        assert_eq!(task.value(), 3);
        assert!(!task.is_errored());
    }

    #[test]
    fn test_task_error_state() {
        let manager = ProgressManager::hidden();
        let task = manager.add_task(TaskKind::Decrypt, "cenc");
        task.set_error("dependent download failed");
        assert!(task.is_errored());
        assert!(task.is_finished());
    }

    #[test]
    fn test_speed_container_window() {
        let speed = SpeedContainer::default();
        speed.add(4096);
        assert_eq!(speed.total_bytes(), 4096);
        // within the first second the ring is empty and now_speed is 0
        speed.tick();
        assert_eq!(speed.now_speed(), 0);
        std::thread::sleep(Duration::from_millis(1100));
        speed.tick();
        // one full window folded in: mean of a single sample
        assert_eq!(speed.now_speed(), 4096);
    }
}
