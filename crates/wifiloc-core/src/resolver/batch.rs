use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::ResolverError;
use crate::ap::ApId;
use crate::models::ResolvedLocation;

/// Answers from one resolver call, keyed by access point.
pub type Resolved = HashMap<ApId, ResolvedLocation>;

/// A remote geolocation service.
///
/// One call is one remote request. Identifiers the service cannot place
/// are simply absent from the returned map.
#[async_trait]
pub trait LocationResolver: Send + Sync {
    async fn resolve(&self, aps: &[ApId]) -> Result<Resolved, ResolverError>;
}

/// Bounded-size front for a `LocationResolver`.
///
/// Callers chunk their work with `chunks`; a call with more than
/// `batch_size` identifiers is refused before anything goes on the wire.
/// Answers for identifiers that were not asked for, or with impossible
/// coordinates, are dropped and so count as "no answer".
#[derive(Clone)]
pub struct BatchResolver {
    inner: Arc<dyn LocationResolver>,
    batch_size: usize,
}

impl BatchResolver {
    pub fn new(inner: Arc<dyn LocationResolver>, batch_size: usize) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Split `aps` into request-sized pieces.
    pub fn chunks<'a>(&self, aps: &'a [ApId]) -> impl Iterator<Item = &'a [ApId]> {
        aps.chunks(self.batch_size)
    }

    pub async fn resolve(&self, aps: &[ApId]) -> Result<Resolved, ResolverError> {
        if aps.len() > self.batch_size {
            return Err(ResolverError::BatchTooLarge {
                size: aps.len(),
                limit: self.batch_size,
            });
        }
        if aps.is_empty() {
            return Ok(Resolved::new());
        }

        let answers = self.inner.resolve(aps).await?;
        let requested: BTreeSet<&ApId> = aps.iter().collect();

        let mut resolved = Resolved::with_capacity(answers.len());
        for (ap, location) in answers {
            if !requested.contains(&ap) {
                debug!(ap = %ap, "Ignoring answer for identifier that was not requested");
            } else if !location.is_valid() {
                warn!(ap = %ap, ?location, "Discarding implausible location");
            } else {
                resolved.insert(ap, location);
            }
        }

        debug!(requested = aps.len(), resolved = resolved.len(), "Batch resolved");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedResolver {
        answers: Resolved,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl LocationResolver for FixedResolver {
        async fn resolve(&self, aps: &[ApId]) -> Result<Resolved, ResolverError> {
            self.calls.lock().unwrap().push(aps.len());
            Ok(self.answers.clone())
        }
    }

    fn ap(n: u8) -> ApId {
        ApId::parse(&format!("00:00:00:00:00:{:02x}", n)).unwrap()
    }

    fn resolver(answers: Resolved) -> (Arc<FixedResolver>, BatchResolver) {
        let fixed = Arc::new(FixedResolver {
            answers,
            calls: Mutex::new(Vec::new()),
        });
        let batch = BatchResolver::new(fixed.clone(), 10);
        (fixed, batch)
    }

    #[tokio::test]
    async fn test_rejects_oversize_batch_without_calling() {
        let (fixed, batch) = resolver(Resolved::new());
        let aps: Vec<ApId> = (0..11).map(ap).collect();

        let err = batch.resolve(&aps).await.unwrap_err();
        assert!(matches!(err, ResolverError::BatchTooLarge { size: 11, limit: 10 }));
        assert!(fixed.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filters_unrequested_and_invalid_answers() {
        let mut answers = Resolved::new();
        answers.insert(ap(1), ResolvedLocation::new(10.0, 20.0, None, Some(5.0)));
        answers.insert(ap(2), ResolvedLocation::new(-180.0, -180.0, None, Some(5.0)));
        answers.insert(ap(9), ResolvedLocation::new(10.0, 20.0, None, Some(5.0)));
        let (_, batch) = resolver(answers);

        let resolved = batch.resolve(&[ap(1), ap(2), ap(3)]).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key(&ap(1)));
    }

    #[tokio::test]
    async fn test_empty_request_skips_remote() {
        let (fixed, batch) = resolver(Resolved::new());
        assert!(batch.resolve(&[]).await.unwrap().is_empty());
        assert!(fixed.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_chunks_respect_batch_size() {
        let (_, batch) = resolver(Resolved::new());
        let aps: Vec<ApId> = (0..25).map(ap).collect();
        let sizes: Vec<usize> = batch.chunks(&aps).map(<[ApId]>::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }
}
