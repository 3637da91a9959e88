// Stream writer: fans segment downloads out through the pool and appends the
// bodies to the output file strictly in sequence-number order. A writer task
// owns the file and all ordering state; downloads run concurrently and report
// back over a channel, so exactly one append is ever outstanding.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

use weir_net::{Pool, Scheme};

use crate::error::RecordError;

/// A downloadable resource as the playlist engine hands it over: an absolute
/// URL line, or parts already resolved against the playlist URL.
#[derive(Clone, Debug)]
pub enum FetchTarget {
    Absolute(String),
    Parts {
        scheme: Scheme,
        host: String,
        path: String,
    },
}

enum Command {
    Segment { sequence: u64, target: FetchTarget },
    InitSection { target: FetchTarget },
}

enum Fetched {
    Segment { sequence: u64, body: Option<Bytes> },
    InitSection { body: Option<Bytes> },
}

#[derive(Clone, Copy)]
enum FetchKind {
    Segment(u64),
    InitSection,
}

/// Handle to the writer task.
pub struct StreamWriter {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl StreamWriter {
    /// Open `file_name` for append/create/write and start the writer task.
    pub async fn open(file_name: &str, pool: Pool) -> Result<Self, RecordError> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .write(true)
            .open(file_name)
            .await
            .map_err(|source| {
                error!(file = file_name, error = %source, "failed to open output file");
                RecordError::OpenOutput {
                    path: file_name.to_string(),
                    source,
                }
            })?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(WriterTask::new(file, pool, commands_rx).run());
        Ok(Self {
            commands: commands_tx,
            task,
        })
    }

    /// Register segment `sequence` for download. Admission is idempotent
    /// across playlist polls: only sequence numbers above the highest one
    /// seen so far are accepted (the very first registration always is).
    pub fn add_segment(&self, sequence: u64, target: FetchTarget) {
        let _ = self.commands.send(Command::Segment { sequence, target });
    }

    /// Register the media initialization section. Honored only before the
    /// first segment registration; the body is written exactly once, ahead
    /// of every segment, and no segment is written while the fetch is still
    /// pending.
    pub fn add_init_section(&self, target: FetchTarget) {
        let _ = self.commands.send(Command::InitSection { target });
    }

    /// Close the intake and wait for every in-flight download and write to
    /// drain.
    pub async fn finish(self) {
        drop(self.commands);
        let _ = self.task.await;
    }
}

#[derive(Debug, Eq, PartialEq)]
enum InitSection {
    /// No init section known, or its fetch failed; segments may be written.
    Absent,
    /// Fetch outstanding: segment writes are held back.
    Fetching,
    /// Written at the head of the file; never fetched again.
    Done,
}

struct WriterTask {
    file: File,
    pool: Pool,
    commands: mpsc::UnboundedReceiver<Command>,
    fetched_tx: mpsc::UnboundedSender<Fetched>,
    fetched_rx: mpsc::UnboundedReceiver<Fetched>,
    /// Sequence numbers with a download outstanding.
    in_progress: BTreeSet<u64>,
    /// Completed segments not yet written, ordered by sequence number.
    ready: BTreeMap<u64, Bytes>,
    last_downloaded: u64,
    last_written: u64,
    init_section: InitSection,
    first_segment: bool,
}

impl WriterTask {
    fn new(file: File, pool: Pool, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let (fetched_tx, fetched_rx) = mpsc::unbounded_channel();
        Self {
            file,
            pool,
            commands,
            fetched_tx,
            fetched_rx,
            in_progress: BTreeSet::new(),
            ready: BTreeMap::new(),
            last_downloaded: 0,
            last_written: 0,
            init_section: InitSection::Absent,
            first_segment: true,
        }
    }

    async fn run(mut self) {
        let mut closed = false;
        loop {
            tokio::select! {
                command = self.commands.recv(), if !closed => match command {
                    Some(command) => self.handle_command(command),
                    None => closed = true,
                },
                fetched = self.fetched_rx.recv() => match fetched {
                    Some(fetched) => self.handle_fetched(fetched).await,
                    None => break,
                },
            }
            self.write_ready().await;
            if closed && self.in_progress.is_empty() && self.init_section != InitSection::Fetching
            {
                break;
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Segment { sequence, target } => {
                if sequence > self.last_downloaded || self.first_segment {
                    self.first_segment = false;
                    self.last_downloaded = sequence;
                    self.in_progress.insert(sequence);
                    self.spawn_fetch(target, FetchKind::Segment(sequence));
                }
            }
            Command::InitSection { target } => {
                if self.first_segment && self.init_section == InitSection::Absent {
                    self.init_section = InitSection::Fetching;
                    self.spawn_fetch(target, FetchKind::InitSection);
                }
            }
        }
    }

    fn spawn_fetch(&self, target: FetchTarget, kind: FetchKind) {
        let pool = self.pool.clone();
        let fetched = self.fetched_tx.clone();
        tokio::spawn(async move {
            let result = match target {
                FetchTarget::Absolute(url) => pool.get_url(&url).await,
                FetchTarget::Parts { scheme, host, path } => pool.get(scheme, &host, &path).await,
            };
            let body = match result {
                Ok(response) if response.is_ok() => Some(response.body),
                Ok(response) => {
                    match kind {
                        FetchKind::Segment(sequence) => error!(
                            status = response.status,
                            sequence, "unexpected media segment response"
                        ),
                        FetchKind::InitSection => error!(
                            status = response.status,
                            "unexpected media initialization section response"
                        ),
                    }
                    None
                }
                // The pool already logged the failure.
                Err(_) => None,
            };
            let message = match kind {
                FetchKind::Segment(sequence) => Fetched::Segment { sequence, body },
                FetchKind::InitSection => Fetched::InitSection { body },
            };
            let _ = fetched.send(message);
        });
    }

    async fn handle_fetched(&mut self, fetched: Fetched) {
        match fetched {
            Fetched::Segment { sequence, body } => {
                self.in_progress.remove(&sequence);
                if let Some(body) = body {
                    trace!(sequence, size = body.len(), "received media segment");
                    self.ready.insert(sequence, body);
                }
            }
            Fetched::InitSection { body } => match body {
                Some(body) => {
                    trace!(size = body.len(), "received media initialization section");
                    match self.file.write_all(&body).await {
                        Ok(()) => trace!("wrote media initialization section"),
                        Err(err) => error!(
                            error = %err,
                            "failed to write media initialization section"
                        ),
                    }
                    self.init_section = InitSection::Done;
                }
                None => {
                    error!("failed to get the media initialization section");
                    self.init_section = InitSection::Absent;
                }
            },
        }
    }

    /// Append every segment that is safe to commit: in ascending order, never
    /// past the lowest sequence number still being fetched, and not at all
    /// while an init-section fetch is pending.
    async fn write_ready(&mut self) {
        if self.init_section == InitSection::Fetching {
            return;
        }
        while let Some(entry) = self.ready.first_entry() {
            let sequence = *entry.key();
            if self.in_progress.first().is_some_and(|&lowest| sequence > lowest) {
                break;
            }
            let body = entry.remove();
            self.log_gap(sequence);
            match self.file.write_all(&body).await {
                Ok(()) => trace!(sequence, "wrote media segment"),
                Err(err) => {
                    // An append that failed part-way is unrecoverable; count
                    // the segment as done and keep recording.
                    error!(sequence, error = %err, "failed to write media segment");
                }
            }
            self.last_written = sequence;
        }
        // Both sets are bounded by the playlist window; growth past that
        // means admission or draining is broken.
        debug_assert!(self.in_progress.len() <= 1024);
        debug_assert!(self.ready.len() <= 1024);
    }

    fn log_gap(&self, sequence: u64) {
        // While nothing has been written, a "gap" is just the start of the
        // stream.
        if self.last_written == 0 {
            return;
        }
        let gap = sequence.saturating_sub(self.last_written);
        if gap == 2 {
            error!(sequence = sequence - 1, "dropped media segment");
        } else if gap > 2 {
            error!(
                first = self.last_written + 1,
                last = sequence - 1,
                "dropped media segments"
            );
        }
    }
}
