//! Generation dispatcher: one image job at a time against the image backend.

use crate::concurrency::JobSlot;
use crate::error::{BotError, BotResult};
use crate::lifecycle::BackendProcess;
use crate::prompt::GenerationRequest;
use crate::providers::ImageBackend;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Short opaque reference carried by interactive controls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Arc<[u8]>,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub id: RecordId,
    pub request: GenerationRequest,
    /// Always concrete once generation succeeded
    pub seed: u64,
    pub requester: String,
    pub artifact: Artifact,
    pub created_at: DateTime<Utc>,
}

pub struct GenerationDispatcher {
    backend: BackendProcess,
    client: Arc<dyn ImageBackend>,
    slot: JobSlot,
    busy_wait: Duration,
    ready_timeout: Duration,
}

impl GenerationDispatcher {
    pub fn new(
        backend: BackendProcess,
        client: Arc<dyn ImageBackend>,
        busy_wait: Duration,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            client,
            slot: JobSlot::new("image-generation"),
            busy_wait,
            ready_timeout,
        }
    }

    pub fn backend(&self) -> &BackendProcess {
        &self.backend
    }

    pub fn is_busy(&self) -> bool {
        !self.slot.is_free()
    }

    /// Stop the image backend, holding the slot so no job starts meanwhile.
    /// Refused with `Busy` while a job owns the slot.
    pub async fn stop_backend(&self) -> BotResult<bool> {
        let Some(_slot) = self.slot.try_acquire() else {
            return Err(BotError::Busy("job in flight".into()));
        };
        Ok(self.backend.stop().await)
    }

    /// Run one generation job.
    ///
    /// The slot is taken before the backend is started, so a request that
    /// arrives during a cold start is refused right away instead of waiting
    /// for the start only to find the slot taken.
    pub async fn dispatch(
        &self,
        request: GenerationRequest,
        requester: &str,
    ) -> BotResult<GenerationRecord> {
        let Some(_slot) = self.slot.acquire_timeout(self.busy_wait).await else {
            tracing::info!(
                requester,
                rejected_total = self.slot.rejected_count(),
                "image job rejected, slot occupied"
            );
            return Err(BotError::Busy("an image is already being generated".into()));
        };

        self.backend.ensure_ready(self.ready_timeout).await?;
        let _lease = self.backend.lease();

        let started = std::time::Instant::now();
        let output = self.client.txt2img(&request).await.map_err(|e| {
            tracing::warn!(requester, "txt2img failed: {e:#}");
            BotError::backend(self.backend.name(), &e)
        })?;
        self.backend.record_activity();

        let seed = request.seed.or(output.seed).ok_or_else(|| BotError::Backend {
            backend: self.backend.name().to_string(),
            detail: "server did not report the seed it used".into(),
        })?;

        let id = RecordId::generate();
        tracing::info!(
            record = %id,
            requester,
            seed,
            upscale = request.upscale,
            jobs_total = self.slot.granted_count(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "image generated"
        );

        Ok(GenerationRecord {
            artifact: Artifact {
                bytes: output.image.into(),
                file_name: format!("paint_{id}_{seed}.png"),
            },
            id,
            request,
            seed,
            requester: requester.to_string(),
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::prompt::GenerationRequest;
    use crate::providers::{ImageBackend, ImageOutput};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Image server stand-in that tracks overlapping submissions.
    #[derive(Default)]
    pub struct FakeImage {
        pub delay: Duration,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub next_seed: AtomicU64,
        pub fail: AtomicBool,
        pub hide_seed: AtomicBool,
    }

    impl FakeImage {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                next_seed: AtomicU64::new(1000),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ImageBackend for FakeImage {
        async fn txt2img(&self, request: &GenerationRequest) -> anyhow::Result<ImageOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("forge API error (500 Internal Server Error): CUDA out of memory");
            }
            let random = self.next_seed.fetch_add(1, Ordering::SeqCst);
            Ok(ImageOutput {
                image: b"\x89PNG fake".to_vec(),
                seed: if self.hide_seed.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(request.seed.unwrap_or(random))
                },
            })
        }
    }
}
