//! The single catalog writer.
//!
//! All catalog writes are linearized through one thread owning its own
//! connection. Two queues feed it: `High` for inventory and progress
//! writes, `Normal` for synchronization operations. After ten consecutive
//! high-priority operations one queued normal operation is served, so the
//! normal queue cannot starve.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use rusqlite::Connection;

/// Queue priority of a catalog write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Inventory and progress writes
    High,
    /// Synchronization operations
    Normal,
}

/// Work-stealing bound: after this many consecutive high-priority
/// operations one normal operation is processed if queued.
const HIGH_PRIORITY_BURST: u32 = 10;

type WriteOp = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Handle to a submitted write; resolves once the writer executed it.
pub struct Pending<R> {
    rx: Receiver<Result<R, Error>>,
}

impl<R> Pending<R> {
    /// Block until the writer has processed the operation.
    pub fn wait(self) -> Result<R, Error> {
        self.rx
            .recv()
            .map_err(|_| format_err!("catalog writer gone before op completed"))?
    }
}

/// The writer thread and its submission queues.
pub struct CatalogWriter {
    high_tx: Sender<(String, WriteOp)>,
    normal_tx: Sender<(String, WriteOp)>,
    handle: Option<JoinHandle<()>>,
}

impl CatalogWriter {
    pub fn spawn(conn: Connection, warn_threshold: Duration, heartbeat: Duration) -> Self {
        let (high_tx, high_rx) = unbounded();
        let (normal_tx, normal_rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("catalog-writer".to_string())
            .spawn(move || writer_loop(conn, high_rx, normal_rx, warn_threshold, heartbeat))
            .expect("unable to spawn catalog writer thread");
        Self {
            high_tx,
            normal_tx,
            handle: Some(handle),
        }
    }

    /// Submit a write operation; the result arrives through the returned
    /// [`Pending`] once the writer processed it.
    pub fn submit<R, F>(&self, priority: Priority, description: &str, op: F) -> Pending<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<R, Error> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let boxed: WriteOp = Box::new(move |conn| {
            let _ = tx.send(op(conn));
        });
        let queue = match priority {
            Priority::High => &self.high_tx,
            Priority::Normal => &self.normal_tx,
        };
        if queue.send((description.to_string(), boxed)).is_err() {
            log::error!("catalog writer queue closed, dropping '{}'", description);
        }
        Pending { rx }
    }

    /// Wait until everything queued so far has been processed.
    pub fn drain(&self) -> Result<(), Error> {
        self.submit(Priority::Normal, "drain", |_| Ok(())).wait()
    }
}

impl Drop for CatalogWriter {
    fn drop(&mut self) {
        // closing the queues stops the loop once it drained them
        let (dead_high, _) = unbounded();
        let (dead_normal, _) = unbounded();
        self.high_tx = dead_high;
        self.normal_tx = dead_normal;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_op(conn: &mut Connection, description: &str, op: WriteOp, warn_threshold: Duration) {
    let started = Instant::now();
    op(conn);
    let elapsed = started.elapsed();
    if elapsed >= warn_threshold {
        log::warn!("slow catalog write '{}' took {:?}", description, elapsed);
    } else {
        log::debug!("catalog write '{}' took {:?}", description, elapsed);
    }
}

fn writer_loop(
    mut conn: Connection,
    high_rx: Receiver<(String, WriteOp)>,
    normal_rx: Receiver<(String, WriteOp)>,
    warn_threshold: Duration,
    heartbeat: Duration,
) {
    let mut consecutive_high: u32 = 0;
    let mut high_open = true;
    let mut normal_open = true;

    loop {
        // starvation guard: one normal op after a high-priority burst
        if consecutive_high >= HIGH_PRIORITY_BURST {
            match normal_rx.try_recv() {
                Ok((description, op)) => {
                    run_op(&mut conn, &description, op, warn_threshold);
                    consecutive_high = 0;
                    continue;
                }
                Err(TryRecvError::Empty) => consecutive_high = 0,
                Err(TryRecvError::Disconnected) => normal_open = false,
            }
        }

        match high_rx.try_recv() {
            Ok((description, op)) => {
                run_op(&mut conn, &description, op, warn_threshold);
                consecutive_high += 1;
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => high_open = false,
        }
        match normal_rx.try_recv() {
            Ok((description, op)) => {
                run_op(&mut conn, &description, op, warn_threshold);
                consecutive_high = 0;
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => normal_open = false,
        }

        if !high_open && !normal_open {
            break;
        }

        // one side closed: block on the surviving queue only
        if !high_open || !normal_open {
            let (rx, is_high) = if high_open {
                (&high_rx, true)
            } else {
                (&normal_rx, false)
            };
            match rx.recv_timeout(heartbeat) {
                Ok((description, op)) => {
                    run_op(&mut conn, &description, op, warn_threshold);
                    if is_high {
                        consecutive_high += 1;
                    } else {
                        consecutive_high = 0;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    if is_high {
                        high_open = false;
                    } else {
                        normal_open = false;
                    }
                }
            }
            continue;
        }

        // idle: wait for work, pinging the connection on the heartbeat
        crossbeam_channel::select! {
            recv(high_rx) -> msg => match msg {
                Ok((description, op)) => {
                    run_op(&mut conn, &description, op, warn_threshold);
                    consecutive_high += 1;
                }
                Err(_) => high_open = false,
            },
            recv(normal_rx) -> msg => match msg {
                Ok((description, op)) => {
                    run_op(&mut conn, &description, op, warn_threshold);
                    consecutive_high = 0;
                }
                Err(_) => normal_open = false,
            },
            default(heartbeat) => {
                match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
                    Ok(_) => log::debug!("catalog heartbeat ok"),
                    Err(err) => log::warn!("catalog heartbeat failed: {}", err),
                }
            }
        }
    }
    log::debug!("catalog writer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn testdir(name: &str) -> PathBuf {
        let mut dir: PathBuf = String::from("./target/testout").into();
        dir.push(module_path!());
        dir.push(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn writer_conn(dir: &PathBuf) -> Connection {
        let conn = Connection::open(dir.join("catalog.db")).unwrap();
        conn.execute_batch("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v INTEGER)")
            .unwrap();
        conn
    }

    #[test]
    fn test_submit_returns_result() -> Result<(), Error> {
        let dir = testdir("submit");
        let writer = CatalogWriter::spawn(
            writer_conn(&dir),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let value = writer
            .submit(Priority::High, "insert", |conn| {
                conn.execute("INSERT INTO kv (k, v) VALUES ('a', 1)", [])?;
                Ok(conn.last_insert_rowid())
            })
            .wait()?;
        assert_eq!(value, 1);
        Ok(())
    }

    #[test]
    fn test_writes_are_linearized() -> Result<(), Error> {
        let dir = testdir("linearized");
        let writer = CatalogWriter::spawn(
            writer_conn(&dir),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let mut pendings = Vec::new();
        for i in 0..50i64 {
            pendings.push(writer.submit(Priority::High, "bump", move |conn| {
                conn.execute(
                    "INSERT INTO kv (k, v) VALUES ('n', ?1)
                     ON CONFLICT(k) DO UPDATE SET v = v + 1",
                    rusqlite::params![i],
                )?;
                Ok(())
            }));
        }
        for pending in pendings {
            pending.wait()?;
        }
        let count: i64 = writer
            .submit(Priority::Normal, "read back", |conn| {
                Ok(conn.query_row("SELECT v FROM kv WHERE k = 'n'", [], |row| row.get(0))?)
            })
            .wait()?;
        // first insert stores 0, the other 49 bump by one each
        assert_eq!(count, 49);
        Ok(())
    }

    #[test]
    fn test_normal_ops_complete_under_high_load() -> Result<(), Error> {
        let dir = testdir("starvation");
        let writer = CatalogWriter::spawn(
            writer_conn(&dir),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        for _ in 0..100 {
            let _ = writer.submit(Priority::High, "noop", |_| Ok(()));
        }
        // must resolve even while the high queue is busy
        writer
            .submit(Priority::Normal, "sync", |_| Ok(()))
            .wait()?;
        writer.drain()?;
        Ok(())
    }
}
