use async_trait::async_trait;
use tracing::{debug, warn};

use crate::delivery::{DeliveryError, LocalMedia, RateLimitedSender};
use crate::platform::MediaRef;

/// Downloads source media so it can be re-uploaded to the target.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, media: &MediaRef) -> Result<LocalMedia, DeliveryError>;
}

/// Fetch under the download retry policy.
pub async fn fetch_with_retries(
    fetcher: &dyn MediaFetcher,
    sender: &RateLimitedSender,
    media: &MediaRef,
) -> Result<LocalMedia, DeliveryError> {
    sender.call("download", || fetcher.fetch(media)).await
}

/// Remove downloaded temp files. Missing files are fine.
pub fn cleanup_files(files: &[LocalMedia]) {
    for file in files {
        match std::fs::remove_file(&file.path) {
            Ok(()) => debug!("Removed temp file {}", file.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {}: {}", file.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::RetryPolicy;
    use crate::platform::MediaKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyFetcher {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MediaFetcher for FlakyFetcher {
        async fn fetch(&self, media: &MediaRef) -> Result<LocalMedia, DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(DeliveryError::Transient("connection reset".to_string()));
            }
            Ok(LocalMedia {
                kind: media.kind,
                path: std::env::temp_dir().join(&media.file_id),
            })
        }
    }

    fn media() -> MediaRef {
        MediaRef {
            kind: MediaKind::Photo,
            file_id: "price-mirror-test-photo".to_string(),
            file_name: None,
        }
    }

    fn downloads(attempts: u32) -> RateLimitedSender {
        RateLimitedSender::new(RetryPolicy {
            transient_retries: attempts - 1,
            backoff_step: Duration::from_secs(1),
            rate_limit_margin: Duration::from_secs(1),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_recovers_within_attempts() {
        let fetcher = FlakyFetcher {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let got = fetch_with_retries(&fetcher, &downloads(3), &media()).await;
        assert!(got.is_ok());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_gives_up() {
        let fetcher = FlakyFetcher {
            failures: 5,
            calls: AtomicU32::new(0),
        };
        let got = fetch_with_retries(&fetcher, &downloads(3), &media()).await;
        assert!(got.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cleanup_removes_and_ignores_missing() {
        let path = std::env::temp_dir().join("price-mirror-cleanup-test.bin");
        std::fs::write(&path, b"x").unwrap();
        let files = vec![
            LocalMedia {
                kind: MediaKind::Document,
                path: path.clone(),
            },
            LocalMedia {
                kind: MediaKind::Photo,
                path: std::env::temp_dir().join("price-mirror-never-existed.bin"),
            },
        ];
        cleanup_files(&files);
        assert!(!path.exists());
    }
}
