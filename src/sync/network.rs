use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Current connectivity, observable through a `watch` channel. Receivers
/// only wake on real transitions.
#[derive(Debug)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(connected: bool) -> Self {
        let (tx, _rx) = watch::channel(connected);
        Self { tx }
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current state. Returns true on a disconnected → connected edge.
    pub fn set_connected(&self, connected: bool) -> bool {
        let mut reconnected = false;
        let changed = self.tx.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            reconnected = connected;
            *current = connected;
            true
        });
        if reconnected {
            log::info!("Network reconnected");
        } else if changed {
            log::debug!("Network offline");
        }
        reconnected
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Something that can tell whether the API is reachable right now.
pub trait ConnectivityProbe: Send + Sync + 'static {
    fn check(&self) -> impl Future<Output = bool> + Send;
}

/// Reachable means any HTTP answer at all, even an error status.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> crate::Result<Self> {
        let url = url::Url::parse(url)?.to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(Self { client, url })
    }
}

impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Probe {} failed: {e}", self.url);
                false
            }
        }
    }
}

/// Poll `probe` every `every` and feed the result into `monitor`.
pub fn spawn_probe<P: ConnectivityProbe>(
    monitor: Arc<NetworkMonitor>,
    probe: P,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let connected = probe.check().await;
            monitor.set_connected(connected);
        }
    })
}
