use layerio::{MemoryRaw, RawStream, Result, Whence};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[allow(dead_code)]
pub enum FaultMode {
    Passthrough,
    OneByteChunks,
    ReadWouldBlockEvery(usize),
    PrematureEofAt(usize),
    /// Writes draw from a shared byte budget and would-block once it is spent.
    WriteBudget(Arc<AtomicUsize>),
}

/// Shared call counters, readable after the raw stream moved into a buffered stream.
#[derive(Debug, Clone, Default)]
pub struct CallCounts {
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    seeks: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl CallCounts {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn seeks(&self) -> usize {
        self.seeks.load(Ordering::SeqCst)
    }
}

pub struct FaultyRaw {
    inner: MemoryRaw,
    mode: FaultMode,
    counter: usize,
    counts: CallCounts,
}

#[allow(dead_code)]
impl FaultyRaw {
    pub fn new(inner: MemoryRaw, mode: FaultMode) -> Self {
        Self {
            inner,
            mode,
            counter: 0,
            counts: CallCounts::default(),
        }
    }

    pub fn counts(&self) -> CallCounts {
        self.counts.clone()
    }

    pub fn into_inner(self) -> MemoryRaw {
        self.inner
    }
}

impl RawStream for FaultyRaw {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.counts.reads.fetch_add(1, Ordering::SeqCst);
        self.counter += 1;
        match self.mode {
            FaultMode::OneByteChunks => {
                let n = buf.len().min(1);
                self.inner.read(&mut buf[..n])
            }
            FaultMode::ReadWouldBlockEvery(n) if n != 0 && self.counter.is_multiple_of(n) => {
                Ok(None)
            }
            FaultMode::PrematureEofAt(n) if self.counter >= n => Ok(Some(0)),
            _ => self.inner.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        self.counts.writes.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            FaultMode::WriteBudget(budget) => {
                let available = budget.load(Ordering::SeqCst);
                if available == 0 {
                    return Ok(None);
                }
                let n = available.min(buf.len());
                budget.fetch_sub(n, Ordering::SeqCst);
                self.inner.write(&buf[..n])
            }
            _ => self.inner.write(buf),
        }
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        self.counts.seeks.fetch_add(1, Ordering::SeqCst);
        self.inner.seek(offset, whence)
    }

    fn truncate(&mut self, size: Option<i64>) -> Result<i64> {
        self.inner.truncate(size)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }

    fn readable(&self) -> bool {
        self.inner.readable()
    }

    fn writable(&self) -> bool {
        self.inner.writable()
    }

    fn seekable(&self) -> bool {
        self.inner.seekable()
    }
}
