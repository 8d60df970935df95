use crate::prelude::*;

use crate::solar::Client;
use net2::TcpStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const ATTEMPTS_PER_BACKOFF: u32 = 10;

pub type Inverter = Client<Connection<TcpStream>>;

/// Reconnect delays: 1s, doubling after every 10 attempts until it reaches
/// 5 minutes. Never gives up.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay: INITIAL_BACKOFF,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay;

        if self.delay < MAX_BACKOFF {
            self.attempts += 1;
            if self.attempts >= ATTEMPTS_PER_BACKOFF {
                self.delay *= 2;
                self.attempts = 0;
            }
        }

        delay
    }
}

// One TCP connection with its multiplexer task. Dropping it tears the
// connection down.
struct Session {
    inverter: Inverter,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct Agent {
    config: Config,
    channels: Channels,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: Config, channels: Channels, shutdown: CancellationToken) -> Self {
        Self {
            config,
            channels,
            shutdown,
        }
    }

    /// Connects, logs in and polls every interval until shutdown.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.connect().await?;
        self.login(&session).await;
        self.query_device_info(&session).await;

        let interval = self.config.interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.config.log_query() {
                info!("querying...");
            }

            let result = session.inverter.query().await;
            match result {
                Ok(telemetry) => self.publish(telemetry),
                Err(err) => match self.recover(session, err).await {
                    Some(recovered) => session = recovered,
                    None => break,
                },
            }
        }

        info!("agent stopped");
        Ok(())
    }

    /// Connects, logs in and reads a single record.
    pub async fn once(&self) -> Result<Telemetry> {
        let session = self.connect().await?;
        self.login(&session).await;
        self.query_device_info(&session).await;

        Ok(session.inverter.query().await?)
    }

    async fn connect(&self) -> Result<Session> {
        let m = &self.config.modbus;
        info!("connecting to inverter at {}:{}", m.host(), m.port());

        let stream = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((m.host().to_owned(), m.port())),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => bail!("failed to connect to inverter: {}", e),
            Err(_) => bail!("connection timeout after {:?}", CONNECT_TIMEOUT),
        };

        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(TCP_KEEPALIVE)) {
            warn!("Failed to set TCP keepalive: {}", e);
        }
        let stream = TcpStream::from_std(std_stream)?;

        if m.use_tcp_nodelay() {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        info!("connected to inverter at {}:{}", m.host(), m.port());

        self.broadcast_hello().await;

        let conn = Arc::new(
            Connection::new(stream, m.slave_id()).with_request_timeout(m.request_timeout()),
        );
        let token = self.shutdown.child_token();
        let task = tokio::spawn({
            let conn = conn.clone();
            let token = token.clone();
            async move {
                if let Err(e) = conn.run(token).await {
                    warn!("modbus session ended: {}", e);
                }
            }
        });

        let inverter = Client::new(conn)
            .with_login_delay(m.login_delay())
            .with_login_timeout(m.login_timeout());

        Ok(Session {
            inverter,
            token,
            task,
        })
    }

    async fn broadcast_hello(&self) {
        let b = &self.config.broadcast;
        if !b.enabled() {
            return;
        }

        let Some(self_ip) = b.self_ip() else {
            warn!("broadcast enabled without self_ip, skipping hello");
            return;
        };

        if let Err(e) = solar::broadcast_hello(b.destination_ip(), self_ip).await {
            warn!(
                "problem sending broadcast hello, proceeding anyway (normal across subnets): {}",
                e
            );
        }
    }

    async fn login(&self, session: &Session) -> bool {
        let m = &self.config.modbus;
        match session.inverter.login(m.username(), m.password()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("problem logging in to inverter, proceeding anyway: {}", e);
                false
            }
        }
    }

    async fn query_device_info(&self, session: &Session) {
        if !self.config.modbus.query_device_info() {
            return;
        }

        if let Err(e) = session.inverter.device_info().await {
            warn!("failed to query device info: {}", e);
        }
    }

    // Re-login first; if that fails, reconnect with backoff until it works
    // or shutdown is requested.
    async fn recover(&self, session: Session, err: crate::error::Error) -> Option<Session> {
        // a shutdown tears the session down and fails the query in flight
        if self.shutdown.is_cancelled() {
            debug!("query interrupted by shutdown: {}", err);
            return None;
        }

        warn!("query error: {}", err);

        if session.is_alive() {
            info!("attempting to log in again (likely timed out)");
            if self.login(&session).await {
                info!("logged in again");
                return Some(session);
            }
        }

        warn!("restarting connection to inverter");
        drop(session);

        let mut backoff = Backoff::new();
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }

            match self.connect().await {
                Ok(session) => {
                    self.login(&session).await;
                    return Some(session);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("failed to connect to inverter: {}, retrying in {:?}", e, delay);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn publish(&self, telemetry: Telemetry) {
        if self.config.log_query() {
            info!("query data: {:?}", telemetry);
        }

        if self
            .channels
            .to_mqtt
            .send(mqtt::ChannelData::Telemetry(Box::new(telemetry)))
            .is_err()
        {
            debug!("no publisher listening, dropping sample");
        }
    }
}
