use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::adu::{Adu, AduCodec};
use crate::error::Error;

const OUTBOUND_QUEUE: usize = 32;
const INBOUND_QUEUE: usize = 32;
const FIRST_TRANSACTION_ID: u16 = 1234;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Waiters = Mutex<HashMap<u16, oneshot::Sender<Adu>>>;

/// Issues one request and resolves to its matching response.
///
/// Implementations must be cancel-safe: dropping the returned future
/// abandons the call without leaving state behind.
#[async_trait]
pub trait FunctionCall: Send + Sync {
    async fn function_call(&self, function_code: u8, data: Vec<u8>) -> Result<Adu, Error>;
}

struct Session<T> {
    framed: Framed<T, AduCodec>,
    outbound: mpsc::Receiver<Adu>,
}

/// Multiplexes concurrent request/response pairs over a single stream.
///
/// Requests are correlated with responses by transaction id, so callers
/// are serviced in whatever order the device answers. The stream itself is
/// only touched by the loops started from [`Connection::run`].
pub struct Connection<T> {
    unit_id: u8,
    request_timeout: Duration,
    transaction_id: AtomicU16,
    waiters: Waiters,
    outbound: mpsc::Sender<Adu>,
    session: tokio::sync::Mutex<Option<Session<T>>>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: T, unit_id: u8) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        Self {
            unit_id,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            transaction_id: AtomicU16::new(FIRST_TRANSACTION_ID),
            waiters: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            session: tokio::sync::Mutex::new(Some(Session {
                framed: Framed::new(stream, AduCodec),
                outbound: outbound_rx,
            })),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Number of calls currently waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.waiters().len()
    }

    /// Runs the receiver, transmitter and dispatcher loops until one of them
    /// fails or `shutdown` is cancelled. The stream is closed on return and
    /// the connection cannot be run again.
    ///
    /// A second concurrent call fails immediately with `SessionActive`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), Error> {
        let mut guard = self.session.try_lock().map_err(|_| Error::SessionActive)?;
        let Session {
            framed,
            mut outbound,
        } = guard.take().ok_or(Error::ConnectionClosed)?;

        let (mut sink, mut stream) = framed.split();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let token = shutdown.child_token();

        info!("modbus session started for unit {}", self.unit_id);

        let result = futures::try_join!(
            Self::receiver(&mut stream, inbound_tx, &token),
            Self::transmitter(&mut sink, &mut outbound, &token),
            self.dispatcher(&mut inbound_rx, &token),
        );
        token.cancel();

        // refuse new requests first, then release everyone still waiting
        outbound.close();
        self.waiters().clear();

        match result {
            Ok(_) | Err(Error::Cancelled) => {
                info!("modbus session for unit {} stopped", self.unit_id);
                Ok(())
            }
            Err(e) => {
                info!("modbus session for unit {} failed: {}", self.unit_id, e);
                Err(e)
            }
        }
    }

    /// Sends one request and waits up to `timeout` for its response.
    pub async fn call(
        &self,
        function_code: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Adu, Error> {
        tokio::time::timeout(timeout, self.transact(function_code, data))
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    async fn transact(&self, function_code: u8, data: Vec<u8>) -> Result<Adu, Error> {
        let transaction_id = self.next_transaction_id();
        let mut pending = Pending::register(&self.waiters, transaction_id);

        debug!(
            "modbus call transaction_id={} function_code={:#04x} data={:?}",
            transaction_id, function_code, data
        );

        let request = Adu::new(transaction_id, self.unit_id, function_code, data);
        self.outbound
            .send(request)
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        pending.wait().await
    }

    fn next_transaction_id(&self) -> u16 {
        self.transaction_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<u16, oneshot::Sender<Adu>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn receiver<S>(
        stream: &mut S,
        inbound: mpsc::Sender<Adu>,
        token: &CancellationToken,
    ) -> Result<(), Error>
    where
        S: Stream<Item = Result<Adu, Error>> + Unpin,
    {
        loop {
            let adu = tokio::select! {
                _ = token.cancelled() => {
                    debug!("modbus receiver cancelled");
                    return Err(Error::Cancelled);
                }
                frame = stream.next() => match frame {
                    Some(frame) => frame?,
                    None => return Err(Error::ConnectionClosed),
                },
            };

            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                sent = inbound.send(adu) => sent.map_err(|_| Error::ConnectionClosed)?,
            }
        }
    }

    async fn transmitter<S>(
        sink: &mut S,
        outbound: &mut mpsc::Receiver<Adu>,
        token: &CancellationToken,
    ) -> Result<(), Error>
    where
        S: Sink<Adu, Error = Error> + Unpin,
    {
        loop {
            let adu = tokio::select! {
                _ = token.cancelled() => {
                    debug!("modbus transmitter cancelled");
                    return Err(Error::Cancelled);
                }
                adu = outbound.recv() => adu.ok_or(Error::ConnectionClosed)?,
            };

            debug!(
                "TX transaction_id={} function_code={:#04x}",
                adu.transaction_id(),
                adu.function_code
            );
            sink.send(adu).await?;
        }
    }

    async fn dispatcher(
        &self,
        inbound: &mut mpsc::Receiver<Adu>,
        token: &CancellationToken,
    ) -> Result<(), Error> {
        loop {
            let adu = tokio::select! {
                _ = token.cancelled() => {
                    debug!("modbus dispatcher cancelled");
                    return Err(Error::Cancelled);
                }
                adu = inbound.recv() => adu.ok_or(Error::ConnectionClosed)?,
            };

            let transaction_id = adu.transaction_id();
            let waiter = self.waiters().remove(&transaction_id);

            match waiter {
                Some(tx) => {
                    if tx.send(adu).is_err() {
                        debug!("caller for transaction {} went away", transaction_id);
                    }
                }
                None => debug!(
                    "no waiter found for transaction {}, dropping response",
                    transaction_id
                ),
            }
        }
    }
}

#[async_trait]
impl<T> FunctionCall for Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn function_call(&self, function_code: u8, data: Vec<u8>) -> Result<Adu, Error> {
        self.call(function_code, data, self.request_timeout).await
    }
}

// Correlation entry for one in-flight call. Dropping it removes the entry,
// so completed, timed out and cancelled calls all leave the table.
struct Pending<'a> {
    waiters: &'a Waiters,
    transaction_id: u16,
    rx: oneshot::Receiver<Adu>,
}

impl<'a> Pending<'a> {
    fn register(waiters: &'a Waiters, transaction_id: u16) -> Self {
        let (tx, rx) = oneshot::channel();
        waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(transaction_id, tx);

        Self {
            waiters,
            transaction_id,
            rx,
        }
    }

    async fn wait(&mut self) -> Result<Adu, Error> {
        (&mut self.rx).await.map_err(|_| Error::ConnectionClosed)
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.transaction_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn second_session_fails_immediately() {
        let (client, _server) = duplex(1024);
        let conn = Connection::new(client, 1);
        let token = CancellationToken::new();

        let first = conn.run(token.clone());
        let second = async {
            tokio::task::yield_now().await;
            let result = conn.run(token.clone()).await;
            token.cancel();
            result
        };

        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::SessionActive)));
    }

    #[tokio::test]
    async fn closed_connection_cannot_be_rerun() {
        let (client, _server) = duplex(1024);
        let conn = Connection::new(client, 1);
        let token = CancellationToken::new();
        token.cancel();

        assert!(conn.run(token.clone()).await.is_ok());
        assert!(matches!(
            conn.run(token).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn timed_out_call_leaves_no_waiter() {
        let (client, _server) = duplex(1024);
        let conn = Connection::new(client, 1);

        // no session running, so the request is queued and never answered
        let result = conn.call(0x03, vec![0, 0, 0, 1], Duration::from_millis(20)).await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn calls_around_session_end_fail_fast() {
        let (client, _server) = duplex(1024);
        let conn = Connection::new(client, 1);
        let token = CancellationToken::new();

        let racing = async {
            let result = conn.call(0x03, vec![0, 0, 0, 1], Duration::from_secs(60)).await;
            token.cancel();
            result
        };
        let stopping = async {
            tokio::task::yield_now().await;
            token.cancel();
            conn.run(token.clone()).await
        };

        let (racing, stopping) = tokio::time::timeout(
            Duration::from_secs(1),
            async { tokio::join!(racing, stopping) },
        )
        .await
        .expect("calls should not wait for their deadline");

        assert!(stopping.is_ok());
        assert!(matches!(racing, Err(Error::ConnectionClosed)));

        let late = conn.call(0x03, vec![0, 0, 0, 1], Duration::from_secs(60)).await;
        assert!(matches!(late, Err(Error::ConnectionClosed)));
        assert_eq!(conn.in_flight(), 0);
    }

    #[test]
    fn transaction_ids_wrap() {
        let (client, _server) = duplex(16);
        let conn = Connection::new(client, 1);
        conn.transaction_id.store(u16::MAX - 1, Ordering::Relaxed);

        assert_eq!(conn.next_transaction_id(), u16::MAX);
        assert_eq!(conn.next_transaction_id(), 0);
        assert_eq!(conn.next_transaction_id(), 1);
    }
}
