use std::{
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, trace, Instrument};

use crate::{
    cipher::{derive_key, read_iv, CipherSpec, DecryptReader, EncryptWriter, Registry},
    protocol::{Reply, SocksAddr},
    Config, Socks5Socket, TunnelError,
};

const BUFFER_SIZE: usize = 16 * 1024;

/// One half of a relayed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to remote peer, through the encrypting writer.
    Uplink,
    /// Remote peer to client, through the decrypting reader.
    Downlink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uplink => f.write_str("uplink"),
            Direction::Downlink => f.write_str("downlink"),
        }
    }
}

/// When either direction of a session last moved data.
#[derive(Clone)]
struct Activity {
    start: Instant,
    last_millis: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let millis = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_millis.fetch_max(millis, Ordering::Relaxed);
    }

    fn idle_deadline(&self, idle: Duration) -> Instant {
        self.start + Duration::from_millis(self.last_millis.load(Ordering::Relaxed)) + idle
    }
}

/// Runs sessions: SOCKS5 handshake with the client, then an encrypted
/// tunnel to the configured remote peer.
///
/// Cheap to clone; every accepted connection gets its own copy.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<Registry>,
    config: Arc<Config>,
}

impl Relay {
    /// Fails with `UnsupportedCipher` when the configured method is not in
    /// `registry`, so a bad method is caught before anything is accepted.
    pub fn new(registry: Arc<Registry>, config: Arc<Config>) -> crate::Result<Self> {
        registry.lookup(&config.method)?;
        Ok(Self { registry, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handles one client connection from handshake to teardown.
    ///
    /// Both connections are closed when this returns. The error, if any, is
    /// the first one either relay direction hit.
    pub async fn serve<T>(&self, client: T) -> crate::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut socks = Socks5Socket::new(client);
        let request = socks.handshake().await?;
        debug!("Client wants {}", request.target);

        let spec = *self.registry.lookup(&self.config.method)?;
        let key = derive_key(&self.config.password, spec.key_size())?;

        let remote = match self.dial().await {
            Ok(remote) => remote,
            Err(err) => {
                let reply = Reply::from(err.kind());
                debug!("Dialing {} failed, replying {}", self.config.server, reply);
                if let Err(reply_err) = socks.reply(reply, SocksAddr::unspecified()).await {
                    trace!("Could not deliver failure reply: {}", reply_err);
                }
                return Err(err.into());
            }
        };

        let bound = remote.local_addr()?;
        socks.reply(Reply::Success, bound.into()).await?;
        debug!("Tunnel to {} open via {}", self.config.server, bound);

        self.pipe(socks.into_inner(), remote, spec, key, request.raw_target)
            .await?;
        info!("Session for {} closed", request.target);
        Ok(())
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        let connect = TcpStream::connect(self.config.server.as_str());
        match self.config.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connecting to the remote peer timed out",
                )),
            },
            None => connect.await,
        }
    }

    /// Spawns both directions and waits until each has reported.
    ///
    /// A clean EOF on one side leaves the other draining. An error aborts
    /// both tasks, which drops (and so closes) every half they own. With an
    /// idle timeout set, the session also ends once neither direction has
    /// moved data for that long.
    async fn pipe<T>(
        &self,
        client: T,
        remote: TcpStream,
        spec: CipherSpec,
        key: Vec<u8>,
        target_header: Vec<u8>,
    ) -> crate::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (remote_read, remote_write) = remote.into_split();
        let activity = Activity::new();

        let (tx, mut rx) = mpsc::channel::<(Direction, crate::Result<u64>)>(2);

        let up_task = tokio::spawn({
            let tx = tx.clone();
            let key = key.clone();
            let activity = activity.clone();
            async move {
                let result =
                    uplink(client_read, remote_write, spec, key, target_header, activity).await;
                let _ = tx.send((Direction::Uplink, result)).await;
            }
            .in_current_span()
        });
        let down_task = tokio::spawn({
            let activity = activity.clone();
            async move {
                let result = downlink(remote_read, client_write, spec, key, activity).await;
                let _ = tx.send((Direction::Downlink, result)).await;
            }
            .in_current_span()
        });

        let mut outcome = Ok(());
        let mut running = 2;
        while running > 0 {
            let report = match self.config.idle_timeout {
                Some(idle) => tokio::select! {
                    report = rx.recv() => report,
                    _ = sleep_until(activity.idle_deadline(idle)) => {
                        if Instant::now() < activity.idle_deadline(idle) {
                            continue;
                        }
                        debug!("No data in either direction for {:?}", idle);
                        outcome = Err(TunnelError::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no data within the idle timeout",
                        )));
                        break;
                    }
                },
                None => rx.recv().await,
            };
            let Some((direction, result)) = report else {
                break;
            };
            running -= 1;
            match result {
                Ok(bytes) => debug!("{} done after {} bytes", direction, bytes),
                Err(err) => {
                    debug!("{} failed: {}", direction, err);
                    outcome = Err(err);
                    break;
                }
            }
        }

        if outcome.is_err() {
            up_task.abort();
            down_task.abort();
        }
        // Aborted tasks drop their halves once they are polled again; wait
        // for that so both connections are really gone when we return.
        let _ = up_task.await;
        let _ = down_task.await;
        outcome
    }
}

async fn uplink<R, W>(
    client: R,
    remote: W,
    spec: CipherSpec,
    key: Vec<u8>,
    target_header: Vec<u8>,
    activity: Activity,
) -> crate::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut writer = EncryptWriter::with_random_iv(remote, &spec, &key)?;
    writer.write_all(&target_header).await?;
    writer.flush().await?;
    activity.touch();

    let bytes = pump(client, &mut writer, &activity).await?;
    writer.shutdown().await?;
    Ok(bytes)
}

async fn downlink<R, W>(
    mut remote: R,
    mut client: W,
    spec: CipherSpec,
    key: Vec<u8>,
    activity: Activity,
) -> crate::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // The peer only sends its IV once it has something to say.
    let iv = read_iv(&spec, &mut remote).await?;
    activity.touch();
    let reader = DecryptReader::new(remote, &spec, &key, &iv)?;

    let bytes = pump(reader, &mut client, &activity).await?;
    client.shutdown().await?;
    Ok(bytes)
}

/// Copies `reader` into `writer` until EOF, flushing after every chunk.
async fn pump<R, W>(mut reader: R, writer: &mut W, activity: &Activity) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0; BUFFER_SIZE];
    let mut total = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        activity.touch();
        total += n as u64;
    }
}
