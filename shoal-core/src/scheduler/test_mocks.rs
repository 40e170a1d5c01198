//! Mock scheduler for testing code that drives a [`Scheduler`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ReloadableScheduler, Scheduler, SchedulerError};
use crate::config::ShoalConfig;
use crate::connstate::BlacklistedConn;
use crate::torrent::Digest;

/// One recorded call on the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerCall {
    Download { name: String, digest: Digest },
    Probe,
    RemoveTorrent { digest: Digest },
    Stop,
    BlacklistSnapshot,
    Reload { config: ShoalConfig },
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<SchedulerCall>,
    blacklist: Vec<BlacklistedConn>,
    fail_download: bool,
    fail_probe: bool,
    stopped: bool,
}

/// Scheduler double that records every call and returns canned results.
///
/// Clones share the same call log.
#[derive(Debug, Clone, Default)]
pub struct MockScheduler {
    state: Arc<Mutex<MockState>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every download fail with `TorrentNotFound`.
    pub fn fail_downloads(&self) {
        self.state.lock().fail_download = true;
    }

    /// Makes every probe fail with `ProbeTimeout`.
    pub fn fail_probes(&self) {
        self.state.lock().fail_probe = true;
    }

    /// Sets the entries returned by `blacklist_snapshot`.
    pub fn set_blacklist(&self, entries: Vec<BlacklistedConn>) {
        self.state.lock().blacklist = entries;
    }

    /// All calls in order.
    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.state.lock().calls.clone()
    }

    /// Digests passed to `download`, in order.
    pub fn downloaded(&self) -> Vec<Digest> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SchedulerCall::Download { digest, .. } => Some(digest.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Panics unless `call` was recorded.
    pub fn assert_called(&self, call: &SchedulerCall) {
        let calls = self.calls();
        assert!(
            calls.contains(call),
            "expected {call:?} in recorded calls {calls:?}"
        );
    }

    fn record(&self, call: SchedulerCall) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.stopped {
            return Err(SchedulerError::Shutdown);
        }
        Ok(())
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    async fn download(&self, name: &str, digest: &Digest) -> Result<(), SchedulerError> {
        self.record(SchedulerCall::Download {
            name: name.to_string(),
            digest: digest.clone(),
        })?;

        if self.state.lock().fail_download {
            return Err(SchedulerError::TorrentNotFound {
                digest: digest.clone(),
            });
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), SchedulerError> {
        self.record(SchedulerCall::Probe)?;

        if self.state.lock().fail_probe {
            return Err(SchedulerError::ProbeTimeout {
                timeout: ShoalConfig::default().scheduler.probe_timeout,
            });
        }
        Ok(())
    }

    async fn remove_torrent(&self, digest: &Digest) -> Result<(), SchedulerError> {
        self.record(SchedulerCall::RemoveTorrent {
            digest: digest.clone(),
        })
    }

    async fn stop(&self) {
        let mut state = self.state.lock();
        state.calls.push(SchedulerCall::Stop);
        state.stopped = true;
    }

    async fn blacklist_snapshot(&self) -> Result<Vec<BlacklistedConn>, SchedulerError> {
        self.record(SchedulerCall::BlacklistSnapshot)?;
        Ok(self.state.lock().blacklist.clone())
    }
}

#[async_trait]
impl ReloadableScheduler for MockScheduler {
    async fn reload(&self, config: ShoalConfig) -> Result<(), SchedulerError> {
        self.record(SchedulerCall::Reload { config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_calls() {
        let mock = MockScheduler::new();
        let digest = Digest::new("aa").unwrap();

        mock.download("blob", &digest).await.unwrap();
        mock.probe().await.unwrap();
        mock.reload(ShoalConfig::for_testing()).await.unwrap();

        assert_eq!(mock.downloaded(), vec![digest.clone()]);
        mock.assert_called(&SchedulerCall::Probe);
        assert_eq!(mock.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_failures_and_stop() {
        let mock = MockScheduler::new();
        let digest = Digest::new("bb").unwrap();

        mock.fail_downloads();
        mock.fail_probes();
        assert!(matches!(
            mock.download("blob", &digest).await,
            Err(SchedulerError::TorrentNotFound { .. })
        ));
        assert!(matches!(
            mock.probe().await,
            Err(SchedulerError::ProbeTimeout { .. })
        ));

        let shared = mock.clone();
        shared.stop().await;
        shared.stop().await;
        assert!(mock.is_stopped());
        assert!(matches!(
            mock.remove_torrent(&digest).await,
            Err(SchedulerError::Shutdown)
        ));
    }
}
