//! Timeline capture of job execution segments.
//!
//! Every resume of a job records one segment: which job ran, on which
//! scheduler thread, for how long, and how the segment ended (completed,
//! yielded, or parked on a counter). A job that migrates across threads
//! therefore shows up as segments on different rows, with its wait time
//! visible as the gap between a `parked` segment and the next one carrying
//! the same job id. Segments accumulate in thread-local buffers and are
//! gathered when a scheduler thread exits or at export time. The exported
//! file is chrome-tracing JSON and loads in ui.perfetto.dev.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// How a recorded segment gave up its thread.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SegmentEnd {
    /// The job body ran to completion.
    Completed,
    /// Cooperative yield; the job went back to its queue.
    Yielded,
    /// The job parked on a counter.
    Parked,
}

impl SegmentEnd {
    fn label(self) -> &'static str {
        match self {
            SegmentEnd::Completed => "completed",
            SegmentEnd::Yielded => "yielded",
            SegmentEnd::Parked => "parked",
        }
    }
}

struct Segment {
    job_name: &'static str,
    job_id: u64,
    chain: u64,
    thread: usize,
    start_us: u64,
    duration_us: u64,
    end: SegmentEnd,
}

thread_local! {
    static SEGMENTS: RefCell<Vec<Segment>> = RefCell::new(Vec::new());
}

struct Timeline {
    origin: Instant,
    epoch_us: u64,
    collected: Mutex<Vec<Segment>>,
    /// `(thread index, row label)` pairs registered by scheduler threads.
    threads: Mutex<Vec<(usize, String)>>,
}

lazy_static::lazy_static! {
    static ref TIMELINE: Timeline = Timeline {
        origin: Instant::now(),
        epoch_us: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64,
        collected: Mutex::new(Vec::new()),
        threads: Mutex::new(Vec::new()),
    };
}

/// Names the calling scheduler thread's row in the exported timeline.
pub(crate) fn register_thread(index: usize, label: String) {
    TIMELINE.threads.lock().unwrap().push((index, label));
}

/// Moves the current thread's segment buffer into the shared timeline.
/// Each scheduler thread calls this when its loop exits.
pub(crate) fn collect_thread_events() {
    SEGMENTS.with(|buffer| {
        let mut local = buffer.borrow_mut();
        if !local.is_empty() {
            TIMELINE.collected.lock().unwrap().append(&mut local);
        }
    });
}

/// RAII capture of one execution segment. Defaults to `Completed`; the
/// scheduling loop overrides the ending once it sees why the job
/// suspended.
pub(crate) struct TraceGuard {
    job_name: &'static str,
    job_id: u64,
    chain: u64,
    thread: usize,
    start: Instant,
    end: SegmentEnd,
}

impl TraceGuard {
    pub fn new(job_name: &'static str, job_id: u64, chain: u64, thread: usize) -> Self {
        TraceGuard {
            job_name,
            job_id,
            chain,
            thread,
            start: Instant::now(),
            end: SegmentEnd::Completed,
        }
    }

    pub fn end_with(&mut self, end: SegmentEnd) {
        self.end = end;
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        let start_us =
            self.start.duration_since(TIMELINE.origin).as_micros() as u64 + TIMELINE.epoch_us;
        let segment = Segment {
            job_name: self.job_name,
            job_id: self.job_id,
            chain: self.chain,
            thread: self.thread,
            start_us,
            duration_us: self.start.elapsed().as_micros() as u64,
            end: self.end,
        };
        SEGMENTS.with(|buffer| buffer.borrow_mut().push(segment));
    }
}

fn write_thread_row(writer: &mut impl Write, index: usize, label: &str) -> std::io::Result<()> {
    write!(
        writer,
        "{{\"name\":\"thread_name\",\"ph\":\"M\",\"pid\":1,\"tid\":{index},\
         \"args\":{{\"name\":\"{label}\"}}}}"
    )
}

fn write_segment(writer: &mut impl Write, segment: &Segment) -> std::io::Result<()> {
    write!(
        writer,
        "{{\"name\":\"{}\",\"cat\":\"job\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\
         \"pid\":1,\"tid\":{},\"args\":{{\"job_id\":{},\"chain\":{},\"end\":\"{}\"}}}}",
        segment.job_name,
        segment.start_us,
        segment.duration_us,
        segment.thread,
        segment.job_id,
        segment.chain,
        segment.end.label()
    )
}

/// Writes the collected timeline as chrome-tracing JSON: one metadata row
/// per registered scheduler thread, then one complete event per segment.
pub fn export_to_file(path: &str) -> std::io::Result<()> {
    collect_thread_events();
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "[")?;

    let mut first = true;
    for (index, label) in TIMELINE.threads.lock().unwrap().iter() {
        if !first {
            writeln!(writer, ",")?;
        }
        first = false;
        write_thread_row(&mut writer, *index, label)?;
    }
    for segment in TIMELINE.collected.lock().unwrap().iter() {
        if !first {
            writeln!(writer, ",")?;
        }
        first = false;
        write_segment(&mut writer, segment)?;
    }

    writeln!(writer, "\n]")?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_carries_segments_thread_rows_and_endings() {
        register_thread(31, "trace-test-row".to_string());
        {
            let mut guard = TraceGuard::new("trace-test-job", 77, 3, 31);
            guard.end_with(SegmentEnd::Parked);
        }
        let path = std::env::temp_dir().join("weft-trace-test.json");
        let path = path.to_str().unwrap();
        export_to_file(path).unwrap();
        let json = std::fs::read_to_string(path).unwrap();
        assert!(json.contains("trace-test-row"));
        assert!(json.contains("trace-test-job"));
        assert!(json.contains("\"job_id\":77"));
        assert!(json.contains("\"chain\":3"));
        assert!(json.contains("\"end\":\"parked\""));
    }
}
