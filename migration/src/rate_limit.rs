use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

/// Token bucket limiting the number of records written per second.
///
/// The bucket holds one second worth of tokens. A batch larger than that waits for a full
/// bucket and leaves a debt that later batches pay off.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    records_per_second: f64,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(records_per_second: u64) -> Self {
        let records_per_second = records_per_second.max(1) as f64;
        Self {
            records_per_second,
            bucket: Arc::new(Mutex::new(Bucket {
                available: records_per_second,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Waits until `records` may be written.
    pub async fn acquire(&self, records: usize) {
        let requested = records as f64;
        let needed = requested.min(self.records_per_second);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.available = (bucket.available + elapsed * self.records_per_second)
                    .min(self.records_per_second);
                bucket.last_refill = now;

                if bucket.available >= needed {
                    bucket.available -= requested;
                    return;
                }

                (needed - bucket.available) / self.records_per_second
            };

            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}
