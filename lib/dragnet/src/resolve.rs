//! DNS resolver thread pool.
//!
//! Callers hand the pool *batches*: a delimited host string plus a sink for
//! results. Worker threads pull names off the head batch one at a time, so
//! names from the same batch resolve concurrently on different workers.
//!
//! Batches are reference counted. Every worker holds a reference while it
//! emits results for a name, the queue holds one while the batch is
//! unfinished, and the sink's `done` fires exactly once, when the last
//! reference drops. That gives the ordering guarantee callers rely on:
//! `done` happens-after every `resolved` of the batch.
//!
//! Shutdown is collective and deliberately non-draining: the `done` flag is
//! set, queued batches are dropped and worker threads are joined. A batch
//! added shortly before shutdown may see its `done` with no `resolved`
//! calls at all.

use plinth::logging::{trace, warn, Logger};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Delimiters between host names in a batch string.
const DELIMS: &[u8] = b" \t\r\n,";

/// Receives results for one batch. Implementations are shared across worker
/// threads; `resolved` may be called concurrently from several of them.
///
/// `done` must not call back into the pool that owned the batch: the final
/// reference can drop while pool-internal locks are held.
pub trait BatchSink: Send + Sync + 'static {
    fn resolved(&self, host: &str, addr: IpAddr);
    fn done(&self);
}

#[derive(Debug, Clone)]
pub struct PoolOpts {
    pub nthreads: usize,
    pub stack_size: Option<usize>,
}

impl Default for PoolOpts {
    fn default() -> PoolOpts {
        PoolOpts {
            nthreads: 10,
            stack_size: None,
        }
    }
}

struct Batch {
    hosts: Box<str>,
    /// Byte offset of the next unconsumed name. Guarded separately from the
    /// pool queue so workers can chunk names off a batch without serializing
    /// on the pool lock longer than necessary.
    cursor: Mutex<usize>,
    sink: Box<dyn BatchSink>,
}

impl Batch {
    /// Claim the next name. Each name is observed by exactly one caller.
    fn next_host(&self) -> Option<(usize, usize)> {
        let mut cursor = self.cursor.lock().unwrap();
        let bytes = self.hosts.as_bytes();

        let mut start = *cursor;
        while start < bytes.len() && DELIMS.contains(&bytes[start]) {
            start += 1;
        }
        if start >= bytes.len() {
            *cursor = start;
            return None;
        }

        let mut end = start;
        while end < bytes.len() && !DELIMS.contains(&bytes[end]) {
            end += 1;
        }
        *cursor = end;
        Some((start, end))
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.sink.done();
    }
}

struct State {
    queue: VecDeque<Arc<Batch>>,
    done: bool,
}

struct Shared {
    state: Mutex<State>,
    nonempty: Condvar,
}

pub struct Pool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    log: Logger,
}

impl Pool {
    pub fn new(opts: &PoolOpts, log: Logger) -> io::Result<Pool> {
        if opts.nthreads == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "resolver pool needs at least one thread",
            ));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                done: false,
            }),
            nonempty: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(opts.nthreads);
        for i in 0..opts.nthreads {
            let mut builder = thread::Builder::new().name(format!("resolver-{}", i));
            if let Some(size) = opts.stack_size {
                builder = builder.stack_size(size);
            }

            let worker_shared = shared.clone();
            let worker_log = log.clone();
            match builder.spawn(move || worker(worker_shared, worker_log)) {
                Ok(handle) => threads.push(handle),
                Err(err) if i == 0 => return Err(err),
                Err(err) => {
                    // a degraded pool still resolves; only a poolless pool
                    // is a startup failure
                    warn!(log, "resolver thread spawn failed"; "thread" => i, "error" => %err);
                }
            }
        }

        Ok(Pool {
            shared,
            threads,
            log,
        })
    }

    /// Queue a batch. If the pool is already shut down the batch is dropped
    /// on the spot, which fires its `done` synchronously and guarantees no
    /// `resolved` calls.
    pub fn add(&self, hosts: &str, sink: Box<dyn BatchSink>) {
        let batch = Arc::new(Batch {
            hosts: hosts.into(),
            cursor: Mutex::new(0),
            sink,
        });

        {
            let mut state = self.shared.state.lock().unwrap();
            if state.done {
                drop(state);
                drop(batch);
                return;
            }
            state.queue.push_back(batch);
        }
        self.shared.nonempty.notify_all();
    }

    /// Stop the pool: set the done flag, steal and drop the queue, wake and
    /// join every worker. In-flight lookups finish; queued ones do not
    /// start.
    pub fn shutdown(&mut self) {
        let stolen: Vec<Arc<Batch>> = {
            let mut state = self.shared.state.lock().unwrap();
            if state.done && self.threads.is_empty() {
                return;
            }
            state.done = true;
            state.queue.drain(..).collect()
        };
        self.shared.nonempty.notify_all();
        drop(stolen);

        trace!(self.log, "joining resolver threads"; "count" => self.threads.len());
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pop the next name off the head batch, discarding depleted batches. Must
/// run under the pool lock; the returned reference keeps the name slice
/// alive after the lock is released.
fn take_host(state: &mut State) -> Option<(Arc<Batch>, (usize, usize))> {
    loop {
        let head = state.queue.front()?;
        if let Some(range) = head.next_host() {
            return Some((head.clone(), range));
        }
        // depleted batch: release the queue's reference
        state.queue.pop_front();
    }
}

fn worker(shared: Arc<Shared>, log: Logger) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.done {
            return;
        }

        match take_host(&mut state) {
            Some((batch, (start, end))) => {
                drop(state);
                let host = &batch.hosts[start..end];
                resolve_one(host, &*batch.sink, &log);
                drop(batch);
                state = shared.state.lock().unwrap();
            }
            None => {
                state = shared.nonempty.wait(state).unwrap();
            }
        }
    }
}

fn resolve_one(host: &str, sink: &dyn BatchSink, log: &Logger) {
    // Port 0, stream-socket hint: one entry per address family, no
    // per-protocol duplicates. Lookup failures are skipped silently and the
    // batch completes normally.
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => {
            for sa in addrs {
                sink.resolved(host, sa.ip());
            }
        }
        Err(err) => {
            trace!(log, "lookup failed"; "host" => host, "error" => %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth::logging::discard;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        resolved: AtomicUsize,
        done: AtomicUsize,
        resolved_after_done: AtomicUsize,
    }

    impl BatchSink for Arc<CountingSink> {
        fn resolved(&self, _host: &str, _addr: IpAddr) {
            if self.done.load(Ordering::SeqCst) > 0 {
                self.resolved_after_done.fetch_add(1, Ordering::SeqCst);
            }
            self.resolved.fetch_add(1, Ordering::SeqCst);
        }

        fn done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(nthreads: usize) -> Pool {
        Pool::new(
            &PoolOpts {
                nthreads,
                stack_size: None,
            },
            discard(),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(Pool::new(
            &PoolOpts {
                nthreads: 0,
                stack_size: None
            },
            discard()
        )
        .is_err());
    }

    #[test]
    fn test_done_fires_exactly_once_per_batch() {
        let mut p = pool(4);
        let sinks: Vec<Arc<CountingSink>> =
            (0..8).map(|_| Arc::new(CountingSink::default())).collect();

        for sink in &sinks {
            p.add("localhost", Box::new(sink.clone()));
        }
        p.shutdown();

        for sink in &sinks {
            assert_eq!(sink.done.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_resolved_happens_before_done() {
        let mut p = pool(4);
        let sink = Arc::new(CountingSink::default());

        p.add("localhost localhost localhost", Box::new(sink.clone()));
        p.shutdown();

        assert_eq!(sink.done.load(Ordering::SeqCst), 1);
        assert_eq!(sink.resolved_after_done.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_localhost_resolves() {
        let mut p = pool(2);
        let sink = Arc::new(CountingSink::default());

        p.add("localhost", Box::new(sink.clone()));

        // wait for the single name to be consumed and emitted
        for _ in 0..500 {
            if sink.resolved.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(sink.resolved.load(Ordering::SeqCst) >= 1);
        p.shutdown();
        assert_eq!(sink.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_after_shutdown_fires_done_synchronously() {
        let mut p = pool(2);
        p.shutdown();

        let sink = Arc::new(CountingSink::default());
        p.add("localhost", Box::new(sink.clone()));

        // no thread is running anymore, so this happened on our own stack
        assert_eq!(sink.done.load(Ordering::SeqCst), 1);
        assert_eq!(sink.resolved.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_idempotent_and_on_drop() {
        let sink = Arc::new(CountingSink::default());
        {
            let mut p = pool(2);
            p.add("localhost", Box::new(sink.clone()));
            p.shutdown();
            p.shutdown();
        } // drop runs shutdown again
        assert_eq!(sink.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_each_name_claimed_once() {
        let batch = Arc::new(Batch {
            hosts: "a bb  ccc,dddd\n e".into(),
            cursor: Mutex::new(0),
            sink: Box::new(Arc::new(CountingSink::default())),
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let batch = batch.clone();
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some((s, e)) = batch.next_host() {
                    seen.push(batch.hosts[s..e].to_string());
                }
                seen
            }));
        }

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        assert_eq!(all, vec!["a", "bb", "ccc", "dddd", "e"]);
    }

    #[test]
    fn test_empty_batch_completes() {
        let mut p = pool(2);
        let sink = Arc::new(CountingSink::default());
        p.add("  \n ", Box::new(sink.clone()));
        p.shutdown();
        assert_eq!(sink.done.load(Ordering::SeqCst), 1);
        assert_eq!(sink.resolved.load(Ordering::SeqCst), 0);
    }
}
