//! Test doubles: an in-process broker speaking enough RESP for the
//! producer and consumer, and a log sink for asserting on warnings.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Broker clock reported by the fake TIME reply, in seconds
const FAKE_CLOCK_SECS: u64 = 1_700_000_000;

/// Loopback broker answering the handful of commands the pub/sub layer
/// issues.
///
/// XADD returns increasing entry IDs, XREAD honours BLOCK and returns
/// nothing, XREVRANGE finds empty streams, TIME answers after an optional
/// delay. Connections can be severed on demand to emulate a broker restart.
pub(crate) struct FakeBroker {
    address: String,
    accepted: Arc<AtomicUsize>,
    streams: Arc<Streams>,
    sever: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Streams {
    clock_delay: Duration,
    appended: AtomicU64,
    last_read: Mutex<Vec<String>>,
}

impl FakeBroker {
    pub(crate) async fn start() -> Self {
        Self::with_clock_delay(Duration::ZERO).await
    }

    /// Broker whose TIME replies arrive only after `delay`
    pub(crate) async fn with_clock_delay(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let streams = Arc::new(Streams {
            clock_delay: delay,
            ..Streams::default()
        });
        let (sever, _) = broadcast::channel(4);

        let task = {
            let accepted = Arc::clone(&accepted);
            let streams = Arc::clone(&streams);
            let sever = sever.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_connection(
                        stream,
                        Arc::clone(&streams),
                        sever.subscribe(),
                    ));
                }
            })
        };

        Self {
            address,
            accepted,
            streams,
            sever,
            task,
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Connections accepted so far
    pub(crate) fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Entries appended so far
    pub(crate) fn appended(&self) -> u64 {
        self.streams.appended.load(Ordering::SeqCst)
    }

    /// Stream keys named by the most recent XREAD, sorted
    pub(crate) fn last_read(&self) -> Vec<String> {
        let mut keys = self.streams.last_read.lock().clone();
        keys.sort();
        keys
    }

    /// Close every open connection. Later connections are served normally.
    pub(crate) fn sever_connections(&self) {
        let _ = self.sever.send(());
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.sever.send(());
    }
}

async fn serve_connection(
    stream: TcpStream,
    streams: Arc<Streams>,
    mut sever: broadcast::Receiver<()>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let args = tokio::select! {
            _ = sever.recv() => return,
            command = read_command(&mut reader) => match command {
                Ok(Some(args)) => args,
                _ => return,
            },
        };

        let reply = tokio::select! {
            _ = sever.recv() => return,
            reply = reply_to(&args, &streams) => reply,
        };

        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// One RESP array of bulk strings, or `None` at end of stream
async fn read_command<R>(reader: &mut R) -> io::Result<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let count = parse_header(&line, '*')?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len = parse_header(&line, '$')?;

        let mut buf = vec![0; len + 2];
        reader.read_exact(&mut buf).await?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(Some(args))
}

fn parse_header(line: &str, marker: char) -> io::Result<usize> {
    line.trim_end()
        .strip_prefix(marker)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad header {line:?}")))
}

async fn reply_to(args: &[String], streams: &Streams) -> String {
    let command = args.first().map(|c| c.to_ascii_uppercase()).unwrap_or_default();

    match command.as_str() {
        "PING" => "+PONG\r\n".to_string(),
        "TIME" => {
            sleep(streams.clock_delay).await;
            format!("*2\r\n{}{}", bulk(&FAKE_CLOCK_SECS.to_string()), bulk("0"))
        }
        "XADD" => {
            let seq = streams.appended.fetch_add(1, Ordering::SeqCst) + 1;
            bulk(&format!("{}-{seq}", FAKE_CLOCK_SECS * 1000))
        }
        "XREVRANGE" => "*0\r\n".to_string(),
        "XREAD" => {
            if let Some(at) = args.iter().position(|a| a.eq_ignore_ascii_case("STREAMS")) {
                let named = &args[at + 1..];
                *streams.last_read.lock() = named[..named.len() / 2].to_vec();
            }
            let block_ms = args
                .iter()
                .position(|a| a.eq_ignore_ascii_case("BLOCK"))
                .and_then(|i| args.get(i + 1))
                .and_then(|ms| ms.parse().ok())
                .unwrap_or(0);
            sleep(Duration::from_millis(block_ms)).await;
            "*-1\r\n".to_string()
        }
        _ => "+OK\r\n".to_string(),
    }
}

fn bulk(value: &str) -> String {
    format!("${}\r\n{value}\r\n", value.len())
}

/// Collects formatted log output emitted inside [`LogCapture::in_scope`]
#[derive(Clone, Default)]
pub(crate) struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
